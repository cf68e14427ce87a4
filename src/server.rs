//! The remote half of the proxy: accepts tunnel TCP connections, dials the
//! requested target, relays bytes, and runs a UDP relay loop alongside it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;

use crate::address::Address;
use crate::config::Config;
use crate::crypto::{Channel, Cipher, SALT_LEN, derive_key, random_key, random_salt};
use crate::error::{Error, ReplyStatus};
use crate::framing::{self, Reader, Writer};
use crate::metrics::METRICS;
use crate::plugin::TransformChain;
use crate::ratelimit::{GlobalLimiter, PerKeyLimiter};
use crate::relay;
use crate::udp::envelope;
use crate::udp::{IDLE_TIMEOUT, InMemorySessionStore, SessionStore};

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// The key-rotation handle: holds a process-wide cipher used only for
/// internal bookkeeping (the per-session `cipher_epoch` tag), never for the
/// password-derived per-session data key that client and server negotiate
/// via the session salt. Rotating it therefore cannot desync an in-flight
/// or future session's tunnel traffic.
struct RotatingCipher {
	handle: ArcSwap<Cipher>,
	epoch: AtomicU64,
}

impl RotatingCipher {
	fn new(method: crate::crypto::Method) -> Self {
		let key = random_key();
		Self {
			handle: ArcSwap::new(Arc::new(Cipher::new(method, &key))),
			epoch: AtomicU64::new(0),
		}
	}

	fn rotate(&self, method: crate::crypto::Method) {
		let key = random_key();
		self.handle.store(Arc::new(Cipher::new(method, &key)));
		self.epoch.fetch_add(1, Ordering::SeqCst);
	}

	fn current_epoch(&self) -> u64 {
		self.epoch.load(Ordering::SeqCst)
	}
}

pub struct Server {
	config: Arc<Config>,
	rotating: Arc<RotatingCipher>,
	udp_sessions: Arc<InMemorySessionStore>,
	/// Salt negotiated by the TCP UDP_ASSOCIATE connection that provisioned
	/// a given client IP's UDP session, keyed by IP since the client's UDP
	/// source port is not known until its first datagram arrives.
	udp_salts: Arc<DashMap<IpAddr, [u8; SALT_LEN]>>,
	accept_limiter: Arc<GlobalLimiter>,
	udp_limiter: Arc<PerKeyLimiter>,
	transforms: Arc<TransformChain>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Server {
	pub fn new(config: Config) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Self {
			rotating: Arc::new(RotatingCipher::new(config.method)),
			udp_sessions: Arc::new(InMemorySessionStore::new()),
			udp_salts: Arc::new(DashMap::new()),
			accept_limiter: Arc::new(GlobalLimiter::new(config.rate_limit, config.rate_burst)),
			udp_limiter: Arc::new(PerKeyLimiter::new(config.rate_limit, config.rate_burst)),
			transforms: Arc::new(TransformChain::new()),
			config: Arc::new(config),
			shutdown_tx,
			shutdown_rx,
		}
	}

	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	pub async fn run(&self) -> Result<(), Error> {
		let listener = TcpListener::bind(&self.config.server_address)
			.await
			.map_err(Error::Bind)?;
		info!("server listening on {}", listener.local_addr()?);

		if let Some(interval) = self.config.key_rotation_interval() {
			self.spawn_rotation_task(interval);
		}
		self.spawn_gc_task();

		let udp_socket = if self.config.enable_udp {
			Some(Arc::new(
				UdpSocket::bind(&self.config.server_address)
					.await
					.map_err(Error::Bind)?,
			))
		} else {
			None
		};
		if let Some(sock) = udp_socket.clone() {
			self.spawn_udp_loop(sock.clone());
			info!("UDP relay listening on {}", sock.local_addr()?);
		}

		let mut shutdown_rx = self.shutdown_rx.clone();
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, peer)) => {
							if !self.accept_limiter.try_acquire() {
								METRICS.rate_limit_rejection();
								debug!("rejecting {peer}: rate limited");
								continue;
							}
							self.spawn_tcp_session(stream, peer, udp_socket.clone());
						}
						Err(e) => {
							warn!("accept error: {e}");
						}
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

	fn spawn_rotation_task(&self, interval: Duration) {
		let rotating = self.rotating.clone();
		let method = self.config.method;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				rotating.rotate(method);
				info!("rotated internal cipher epoch to {}", rotating.current_epoch());
			}
		});
	}

	fn spawn_gc_task(&self) {
		let sessions = self.udp_sessions.clone();
		let salts = self.udp_salts.clone();
		let udp_limiter = self.udp_limiter.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
			loop {
				ticker.tick().await;
				let expired = sessions.expire_idle(Instant::now(), IDLE_TIMEOUT);
				for addr in &expired {
					salts.remove(&addr.ip());
				}
				if !expired.is_empty() {
					debug!("evicted {} idle UDP sessions", expired.len());
				}
				udp_limiter.gc(IDLE_TIMEOUT);
			}
		});
	}

	fn spawn_tcp_session(&self, stream: TcpStream, peer: SocketAddr, udp_socket: Option<Arc<UdpSocket>>) {
		let config = self.config.clone();
		let transforms = self.transforms.clone();
		let udp_salts = self.udp_salts.clone();
		let epoch = self.rotating.current_epoch();
		METRICS.connection_opened();
		tokio::spawn(async move {
			if let Err(e) =
				handle_tcp_session(stream, peer, config, transforms, udp_socket, udp_salts, epoch).await
			{
				debug!("session with {peer} ended: {e}");
				METRICS.connection_failed();
			}
			METRICS.connection_closed();
		});
	}

	fn spawn_udp_loop(&self, socket: Arc<UdpSocket>) {
		let config = self.config.clone();
		let sessions = self.udp_sessions.clone();
		let salts = self.udp_salts.clone();
		let limiter = self.udp_limiter.clone();
		tokio::spawn(async move {
			if let Err(e) = udp_relay_loop(socket, config, sessions, salts, limiter).await {
				error!("UDP relay loop exited: {e}");
			}
		});
	}
}

/// Reads the tunnel's initial frame: one command byte (`CONNECT` or
/// `UDP_ASSOCIATE`) followed by the target/association [`Address`].
async fn handle_tcp_session(
	mut stream: TcpStream,
	peer: SocketAddr,
	config: Arc<Config>,
	transforms: Arc<TransformChain>,
	udp_socket: Option<Arc<UdpSocket>>,
	udp_salts: Arc<DashMap<IpAddr, [u8; SALT_LEN]>>,
	epoch: u64,
) -> Result<(), Error> {
	let salt = random_salt();
	framing::write_salt(&mut stream, &salt).await?;
	let peer_salt = framing::read_salt(&mut stream).await?;

	let key = derive_key(&config.password, &peer_salt)?;
	let cipher = Arc::new(Cipher::new(config.method, &key));

	let mut reader = Reader::new(cipher.clone(), Channel::ClientLength, Channel::ClientPayload);
	let writer = Writer::new(cipher.clone(), Channel::ServerLength, Channel::ServerPayload);

	let record = reader
		.read_record(&mut stream)
		.await?
		.ok_or_else(|| Error::protocol("connection closed before initial frame"))?;
	if record.is_empty() {
		return Err(Error::protocol("empty initial frame"));
	}
	let command = record[0];
	let dst = Address::decode(&mut &record[1..])?;
	debug!("{peer} [{command:#04x}] -> {dst} (epoch {epoch})");

	match command {
		CMD_CONNECT => match TcpStream::connect(dst.to_host_port()).await {
			Ok(target) => {
				target.set_nodelay(true).ok();
				relay::relay(target, stream, reader, writer, &transforms, config.timeout()).await
			}
			Err(e) => {
				let status = ReplyStatus::from_dial_error(&e);
				warn!("dial {dst} failed: {e} ({status})");
				Err(Error::Dial(e))
			}
		},
		CMD_UDP_ASSOCIATE => {
			let Some(udp_socket) = udp_socket else {
				return Err(Error::protocol("UDP disabled by configuration"));
			};
			udp_salts.insert(peer.ip(), peer_salt);

			let mut writer = writer;
			let bnd = Address::from(udp_socket.local_addr()?);
			let mut reply = Vec::with_capacity(bnd.encoded_len());
			bnd.encode(&mut reply);
			writer.write_record(&mut stream, &reply).await?;

			// Hold the TCP connection open as the liveness channel; the
			// actual datagrams are handled by the UDP relay loop. The
			// session ends when this connection closes.
			let mut discard = [0u8; 64];
			let result = loop {
				match tokio::time::timeout(config.timeout(), stream.read(&mut discard)).await {
					Ok(Ok(0)) => break Ok(()),
					Ok(Ok(_)) => continue,
					Ok(Err(e)) => break Err(Error::Io(e)),
					Err(_) => break Err(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "liveness timeout"))),
				}
			};
			udp_salts.remove(&peer.ip());
			result
		}
		other => Err(Error::protocol(format!("unsupported command 0x{other:02x}"))),
	}
}

async fn udp_relay_loop(
	socket: Arc<UdpSocket>,
	config: Arc<Config>,
	sessions: Arc<InMemorySessionStore>,
	salts: Arc<DashMap<IpAddr, [u8; SALT_LEN]>>,
	limiter: Arc<PerKeyLimiter>,
) -> Result<(), Error> {
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		let (n, src) = socket.recv_from(&mut buf).await?;
		if !limiter.try_acquire(src.ip()) {
			METRICS.rate_limit_rejection();
			continue;
		}
		let datagram = buf[..n].to_vec();
		let socket = socket.clone();
		let config = config.clone();
		let sessions = sessions.clone();
		let salts = salts.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_udp_datagram(socket, config, sessions, salts, src, datagram).await {
				debug!("dropping UDP datagram from {src}: {e}");
			}
		});
	}
}

async fn handle_udp_datagram(
	socket: Arc<UdpSocket>,
	config: Arc<Config>,
	sessions: Arc<InMemorySessionStore>,
	salts: Arc<DashMap<IpAddr, [u8; SALT_LEN]>>,
	src: SocketAddr,
	datagram: Vec<u8>,
) -> Result<(), Error> {
	METRICS.datagram_in();
	let parsed = envelope::parse(&datagram)?;
	let now = envelope::now_unix();
	if envelope::is_stale(parsed.timestamp, now) {
		METRICS.stale_drop();
		return Err(Error::Stale);
	}
	// Check only -- the cleartext, AAD-less preamble nonce must never move
	// the high-water mark by itself, or a spoofed source address carrying a
	// huge nonce and garbage ciphertext would permanently lock out every
	// legitimate lower-nonce datagram that follows. The mark is committed
	// below, only once open and forward have both succeeded.
	if !sessions.check_nonce(src, parsed.nonce) {
		METRICS.replay_drop();
		return Err(Error::Replay);
	}

	let salt = *salts
		.get(&src.ip())
		.ok_or_else(|| Error::protocol("no UDP_ASSOCIATE session for this source"))?;
	let key = derive_key(&config.password, &salt)?;
	let cipher = Cipher::new(config.method, &key);

	let nonce = parsed.nonce;
	let plaintext = parsed.open(&cipher).map_err(|e| {
		METRICS.decrypt_failure();
		e
	})?;
	let mut rest = &plaintext[..];
	let dst = Address::decode(&mut rest)?;
	let payload = rest;

	let target = UdpSocket::bind("0.0.0.0:0").await?;
	target.connect(dst.to_host_port()).await?;
	target.send(payload).await?;

	if !sessions.commit_nonce(src, nonce) {
		// lost a race against a higher nonce committed by a concurrent
		// datagram for the same source; this one is now stale, but it has
		// already been forwarded, which is the correct fail-open behavior.
		METRICS.replay_drop();
	}

	let mut reply_buf = vec![0u8; 64 * 1024];
	let reply_len = tokio::time::timeout(config.timeout(), target.recv(&mut reply_buf))
		.await
		.map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream reply timed out")))??;

	let mut reply_plain = Vec::with_capacity(dst.encoded_len() + reply_len);
	dst.encode(&mut reply_plain);
	reply_plain.extend_from_slice(&reply_buf[..reply_len]);

	let send_nonce = sessions.next_send_counter(src)?;
	let envelope = envelope::seal(&cipher, send_nonce, &reply_plain)?;
	socket.send_to(&envelope, src).await?;
	METRICS.datagram_out();
	Ok(())
}
