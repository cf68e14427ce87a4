//! The local half of the proxy: accepts plaintext SOCKS5 from local
//! applications, dials the remote server per request, and mirrors its
//! framing.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;

use crate::address::Address;
use crate::config::Config;
use crate::crypto::{Channel, Cipher, derive_key, random_salt};
use crate::error::{Error, ReplyStatus};
use crate::framing::{self, Reader, Writer};
use crate::plugin::TransformChain;
use crate::relay;
use crate::socks5::{self, Command};
use crate::udp::envelope;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub struct Client {
	config: Arc<Config>,
	transforms: Arc<TransformChain>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Client {
	pub fn new(config: Config) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Self {
			config: Arc::new(config),
			transforms: Arc::new(TransformChain::new()),
			shutdown_tx,
			shutdown_rx,
		}
	}

	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	pub async fn run(&self) -> Result<(), Error> {
		let listener = TcpListener::bind(&self.config.local_address)
			.await
			.map_err(Error::Bind)?;
		info!("local SOCKS5 listener on {}", listener.local_addr()?);

		let mut shutdown_rx = self.shutdown_rx.clone();
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, peer)) => self.spawn_session(stream, peer),
						Err(e) => warn!("accept error: {e}"),
					}
				}
				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						info!("shutdown signal received, closing listener");
						break;
					}
				}
			}
		}
		Ok(())
	}

	fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
		let config = self.config.clone();
		let transforms = self.transforms.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_local_connection(stream, config, transforms).await {
				debug!("session with {peer} ended: {e}");
			}
		});
	}
}

/// Dial the server and complete the salt exchange: server speaks first, then
/// the client contributes the salt that is actually used for HKDF -- this
/// keeps both directions' wire shape identical without needing two keys.
async fn dial_and_key(config: &Config) -> Result<(TcpStream, Arc<Cipher>), Error> {
	let mut stream = TcpStream::connect(&config.server_address).await?;
	stream.set_nodelay(true).ok();

	let _server_salt = framing::read_salt(&mut stream).await?;
	let salt = random_salt();
	framing::write_salt(&mut stream, &salt).await?;

	let key = derive_key(&config.password, &salt)?;
	Ok((stream, Arc::new(Cipher::new(config.method, &key))))
}

async fn handle_local_connection(
	mut local: TcpStream,
	config: Arc<Config>,
	transforms: Arc<TransformChain>,
) -> Result<(), Error> {
	socks5::negotiate_methods(&mut local).await?;
	let request = match socks5::read_request(&mut local).await {
		Ok(r) => r,
		Err(socks5::RequestError::Unsupported(status)) => {
			let bnd = Address::unspecified_ipv4();
			socks5::write_reply(&mut local, status, &bnd).await?;
			return Err(Error::protocol("unsupported request"));
		}
		Err(socks5::RequestError::Malformed(e)) => return Err(e),
	};

	match request.command {
		Command::Connect => handle_connect(local, request.dst, config, transforms).await,
		Command::UdpAssociate => handle_udp_associate(local, config).await,
	}
}

async fn handle_connect(
	mut local: TcpStream,
	dst: Address,
	config: Arc<Config>,
	transforms: Arc<TransformChain>,
) -> Result<(), Error> {
	let (mut tunnel, cipher) = match dial_and_key(&config).await {
		Ok(pair) => pair,
		Err(e) => {
			let bnd = Address::unspecified_ipv4();
			socks5::write_reply(&mut local, ReplyStatus::GeneralFailure, &bnd).await?;
			return Err(e);
		}
	};

	let mut writer = Writer::new(cipher.clone(), Channel::ClientLength, Channel::ClientPayload);
	let reader = Reader::new(cipher, Channel::ServerLength, Channel::ServerPayload);

	let mut frame = Vec::with_capacity(1 + dst.encoded_len());
	frame.push(CMD_CONNECT);
	dst.encode(&mut frame);
	writer.write_record(&mut tunnel, &frame).await?;

	let bnd = Address::unspecified_ipv4();
	socks5::write_reply(&mut local, ReplyStatus::Success, &bnd).await?;

	relay::relay(local, tunnel, reader, writer, &transforms, config.timeout()).await
}

async fn handle_udp_associate(mut local: TcpStream, config: Arc<Config>) -> Result<(), Error> {
	if !config.enable_udp {
		let bnd = Address::unspecified_ipv4();
		socks5::write_reply(&mut local, ReplyStatus::CommandNotSupported, &bnd).await?;
		return Err(Error::protocol("UDP disabled by configuration"));
	}

	let local_host = config
		.local_address
		.rsplit_once(':')
		.map(|(host, _)| host)
		.unwrap_or("127.0.0.1");
	let udp_socket = Arc::new(UdpSocket::bind(format!("{local_host}:0")).await?);

	let (mut tunnel, cipher) = dial_and_key(&config).await?;
	let mut writer = Writer::new(cipher.clone(), Channel::ClientLength, Channel::ClientPayload);
	let mut reader = Reader::new(cipher.clone(), Channel::ServerLength, Channel::ServerPayload);

	let placeholder = Address::unspecified_ipv4();
	let mut frame = Vec::with_capacity(1 + placeholder.encoded_len());
	frame.push(CMD_UDP_ASSOCIATE);
	placeholder.encode(&mut frame);
	writer.write_record(&mut tunnel, &frame).await?;

	let server_udp = reader
		.read_record(&mut tunnel)
		.await?
		.ok_or_else(|| Error::protocol("tunnel closed before UDP_ASSOCIATE reply"))?;
	let server_udp_addr = Address::decode(&mut &server_udp[..])?;

	let bnd = Address::from(udp_socket.local_addr()?);
	socks5::write_reply(&mut local, ReplyStatus::Success, &bnd).await?;

	let forward = forward_local_datagrams(udp_socket.clone(), cipher.clone(), server_udp_addr.clone(), config.clone());
	let liveness = async {
		let mut discard = [0u8; 64];
		loop {
			match local.read(&mut discard).await {
				Ok(0) | Err(_) => break,
				Ok(_) => continue,
			}
		}
	};

	tokio::select! {
		r = forward => r,
		_ = liveness => Ok(()),
	}
}

async fn forward_local_datagrams(
	udp_socket: Arc<UdpSocket>,
	cipher: Arc<Cipher>,
	server_udp_addr: Address,
	config: Arc<Config>,
) -> Result<(), Error> {
	let mut send_counter: u32 = 0;
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		let (n, local_app) = tokio::time::timeout(config.timeout(), udp_socket.recv_from(&mut buf))
			.await
			.map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle UDP association")))??;

		let (dst, payload) = match socks5::udp::parse(&buf[..n]) {
			Ok(parsed) => parsed,
			Err(_) => continue,
		};

		let mut plaintext = Vec::with_capacity(dst.encoded_len() + payload.len());
		dst.encode(&mut plaintext);
		plaintext.extend_from_slice(payload);

		send_counter = send_counter
			.checked_add(1)
			.ok_or_else(|| Error::crypto("UDP send counter wrapped"))?;
		let envelope = envelope::seal(&cipher, send_counter, &plaintext)?;
		udp_socket.send_to(&envelope, server_udp_addr.to_host_port()).await?;

		let mut reply_buf = vec![0u8; 64 * 1024];
		let reply_len =
			match tokio::time::timeout(config.timeout(), udp_socket.recv_from(&mut reply_buf)).await {
				Ok(Ok((len, _from))) => len,
				_ => continue,
			};

		let parsed = match envelope::parse(&reply_buf[..reply_len]) {
			Ok(p) => p,
			Err(_) => continue,
		};
		let opened = match parsed.open(&cipher) {
			Ok(o) => o,
			Err(_) => continue,
		};
		let mut rest = &opened[..];
		let Ok(reply_dst) = Address::decode(&mut rest) else {
			continue;
		};

		let reply_datagram = socks5::udp::build(&reply_dst, rest);
		udp_socket.send_to(&reply_datagram, local_app).await?;
	}
}
