//! The in-process stand-in for a plugin loader: an ordered list of pure
//! byte transforms applied to each record after decrypt and before
//! re-encrypt. The default list is empty.

use bytes::BytesMut;

use crate::error::Error;

pub type Transform = Box<dyn Fn(&mut BytesMut) -> Result<(), Error> + Send + Sync>;

#[derive(Default)]
pub struct TransformChain {
	transforms: Vec<Transform>,
}

impl TransformChain {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, transform: Transform) {
		self.transforms.push(transform);
	}

	/// Run every transform in order. A failing transform aborts the chain
	/// with its error, exactly like a decrypt failure would abort the
	/// session.
	pub fn apply(&self, buf: &mut BytesMut) -> Result<(), Error> {
		for transform in &self.transforms {
			transform(buf)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_chain_is_a_no_op() {
		let chain = TransformChain::new();
		let mut buf = BytesMut::from(&b"hello"[..]);
		chain.apply(&mut buf).unwrap();
		assert_eq!(&buf[..], b"hello");
	}

	#[test]
	fn transforms_run_in_order() {
		let mut chain = TransformChain::new();
		chain.push(Box::new(|buf: &mut BytesMut| {
			buf.extend_from_slice(b"-a");
			Ok(())
		}));
		chain.push(Box::new(|buf: &mut BytesMut| {
			buf.extend_from_slice(b"-b");
			Ok(())
		}));
		let mut buf = BytesMut::from(&b"x"[..]);
		chain.apply(&mut buf).unwrap();
		assert_eq!(&buf[..], b"x-a-b");
	}

	#[test]
	fn failing_transform_aborts_chain() {
		let mut chain = TransformChain::new();
		chain.push(Box::new(|buf: &mut BytesMut| {
			buf.extend_from_slice(b"-a");
			Ok(())
		}));
		chain.push(Box::new(|_: &mut BytesMut| Err(Error::protocol("rejected"))));
		chain.push(Box::new(|buf: &mut BytesMut| {
			buf.extend_from_slice(b"-never");
			Ok(())
		}));
		let mut buf = BytesMut::from(&b"x"[..]);
		assert!(chain.apply(&mut buf).is_err());
		assert_eq!(&buf[..], b"x-a");
	}
}
