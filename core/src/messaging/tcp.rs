//! Line-framed TCP implementation of the fabric, together with the broker
//! side it talks to.
//!
//! Frames are single-line JSON.  A connection starts with a `hello`
//! carrying the bare identity and password; the broker answers `welcome`
//! with the assigned resource (or `denied`).  Afterwards stanzas, pub/sub
//! items and acknowledged broker requests flow in both directions.  The
//! broker side ([`serve`]) is a thin bridge onto the in-memory broker of
//! [`super::memory`], which does the actual routing; the bundled broker
//! daemon is little more than a socket in front of it.
//!
//! This transport carries no TLS of its own and is meant for loopback and
//! trusted-network deployments; anything else should implement
//! [`Fabric`] on a full messaging stack instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::memory::MemoryBroker;
use super::{
	BrokerCall, BrokerError, BrokerRequest, ConnectOptions, Event, Fabric, FabricError, NodeId,
	Session, Stanza, Tag,
};
use crate::shutdown::Controller;
use crate::types::{Account, Identity};
use crate::utils::spawn_in_span;

/// Frames sent from a connection to the broker.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
enum ClientFrame {
	Hello {
		identity: Identity,
		password: String,
		priority: i8,
	},
	Stanza(Stanza),
	Broker {
		id: u64,
		service: String,
		request: BrokerRequest,
	},
}

/// Frames sent from the broker to a connection.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
enum BrokerFrame {
	Welcome {
		resource: String,
	},
	Denied {
		reason: String,
	},
	Stanza(Stanza),
	Item {
		node: NodeId,
		payload: Tag,
		retract: bool,
	},
	Ack {
		id: u64,
		result: Result<(), BrokerError>,
	},
	Bye {
		reason: String,
	},
}

async fn write_frame<W, F>(writer: &mut W, frame: &F) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
	F: Serialize,
{
	let mut line = serde_json::to_vec(frame).expect("frames always serialise");
	line.push(b'\n');
	writer.write_all(&line).await
}

/// [`Fabric`] connecting to a broker daemon over TCP.
pub struct TcpFabric {
	addr: String,
}

impl TcpFabric {
	pub fn new(addr: impl Into<String>) -> Self {
		Self { addr: addr.into() }
	}
}

#[async_trait]
impl Fabric for TcpFabric {
	async fn connect(
		&self,
		account: &Account,
		options: &ConnectOptions,
	) -> Result<Session, FabricError> {
		if options.tls.root_ca.is_some() {
			warn!("the TCP fabric does not terminate TLS, ignoring the root CA override");
		}

		let stream = TcpStream::connect(&self.addr)
			.await
			.map_err(|error| FabricError::Unreachable(error.to_string()))?;
		let (read_half, write_half) = stream.into_split();
		let mut reader = BufReader::new(read_half).lines();
		let mut writer = write_half;

		write_frame(
			&mut writer,
			&ClientFrame::Hello {
				identity: account.identity.clone(),
				password: account.password.clone(),
				priority: options.priority,
			},
		)
		.await
		.map_err(|error| FabricError::Unreachable(error.to_string()))?;

		let local = match reader.next_line().await {
			Ok(Some(line)) => match serde_json::from_str(&line) {
				Ok(BrokerFrame::Welcome { resource }) => account.identity.with_resource(resource),
				Ok(BrokerFrame::Denied { reason }) => {
					warn!("broker denied the connection: {reason}");
					return Err(FabricError::Auth);
				},
				Ok(other) => {
					return Err(FabricError::Unreachable(format!(
						"protocol violation during handshake: {other:?}",
					)))
				},
				Err(error) => {
					return Err(FabricError::Unreachable(format!(
						"unparsable handshake reply: {error}",
					)))
				},
			},
			Ok(None) => {
				return Err(FabricError::Unreachable(
					"broker closed the connection during the handshake".to_string(),
				))
			},
			Err(error) => return Err(FabricError::Unreachable(error.to_string())),
		};

		let (stanza_tx, mut stanza_rx) = mpsc::unbounded_channel::<Stanza>();
		let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
		let (broker_tx, mut broker_rx) = mpsc::unbounded_channel::<BrokerCall>();

		let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), BrokerError>>>>> =
			Arc::new(Mutex::new(HashMap::new()));
		let next_id = AtomicU64::new(1);

		let writer_pending = pending.clone();
		spawn_in_span(async move {
			loop {
				let frame = tokio::select! {
					stanza = stanza_rx.recv() => match stanza {
						Some(stanza) => ClientFrame::Stanza(stanza),
						None => break,
					},
					call = broker_rx.recv() => match call {
						Some(BrokerCall { service, request, reply }) => {
							let id = next_id.fetch_add(1, Ordering::Relaxed);
							writer_pending.lock().unwrap().insert(id, reply);
							ClientFrame::Broker { id, service, request }
						},
						None => break,
					},
				};
				if write_frame(&mut writer, &frame).await.is_err() {
					break;
				}
			}
			let _ = writer.shutdown().await;
		});

		spawn_in_span(async move {
			let reason = loop {
				match reader.next_line().await {
					Ok(Some(line)) => match serde_json::from_str(&line) {
						Ok(BrokerFrame::Stanza(stanza)) => {
							let _ = event_tx.send(Event::Stanza(stanza));
						},
						Ok(BrokerFrame::Item {
							node,
							payload,
							retract,
						}) => {
							let _ = event_tx.send(Event::PubSubItem {
								node,
								payload,
								retract,
							});
						},
						Ok(BrokerFrame::Ack { id, result }) => {
							if let Some(reply) = pending.lock().unwrap().remove(&id) {
								let _ = reply.send(result);
							}
						},
						Ok(BrokerFrame::Bye { reason }) => break reason,
						Ok(other) => debug!("ignoring unexpected frame: {other:?}"),
						Err(error) => break format!("unparsable frame: {error}"),
					},
					Ok(None) => break "connection closed".to_string(),
					Err(error) => break error.to_string(),
				}
			};
			let _ = event_tx.send(Event::Disconnected { reason });
		});

		info!(%local, "connected to the TCP broker");
		Ok(Session {
			local,
			stanzas: stanza_tx,
			events: event_rx,
			broker: broker_tx,
		})
	}
}

/// Serves broker connections on the given listener, bridging them onto
/// the in-memory broker.  With `open_registration`, unknown accounts are
/// created on their first hello; otherwise they are denied.
pub async fn serve(
	listener: TcpListener,
	broker: MemoryBroker,
	open_registration: bool,
	shutdown: Controller<String>,
) -> Result<()> {
	info!(addr = %listener.local_addr()?, "broker listening");

	loop {
		let accepted = match shutdown.with_cancel(listener.accept()).await {
			Err(reason) => {
				info!("broker stopping: {reason}");
				return Ok(());
			},
			Ok(accepted) => accepted,
		};
		let (stream, peer) = accepted?;
		debug!(%peer, "incoming broker connection");
		spawn_in_span(handle_connection(stream, broker.clone(), open_registration));
	}
}

async fn handle_connection(stream: TcpStream, broker: MemoryBroker, open_registration: bool) {
	let (read_half, write_half) = stream.into_split();
	let mut reader = BufReader::new(read_half).lines();
	let mut writer = write_half;

	// the first frame must be the hello
	let (identity, password, priority) = match reader.next_line().await {
		Ok(Some(line)) => match serde_json::from_str(&line) {
			Ok(ClientFrame::Hello {
				identity,
				password,
				priority,
			}) => (identity, password, priority),
			_ => {
				warn!("connection did not start with a hello");
				return;
			},
		},
		_ => return,
	};

	if open_registration && !broker.has_account(identity.user()) {
		broker.add_account(identity.user(), &password);
	}

	let account = Account::new(identity, password);
	let options = ConnectOptions {
		priority,
		tls: Default::default(),
	};
	let mut session = match broker.connect(&account, &options).await {
		Ok(session) => session,
		Err(error) => {
			let _ = write_frame(
				&mut writer,
				&BrokerFrame::Denied {
					reason: error.to_string(),
				},
			)
			.await;
			return;
		},
	};

	let resource = session
		.local
		.resource()
		.expect("live sessions have a resource")
		.to_string();
	if write_frame(&mut writer, &BrokerFrame::Welcome { resource })
		.await
		.is_err()
	{
		return;
	}

	// single writer task; everything outbound funnels through one channel
	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<BrokerFrame>();
	spawn_in_span(async move {
		while let Some(frame) = out_rx.recv().await {
			if write_frame(&mut writer, &frame).await.is_err() {
				break;
			}
		}
		let _ = writer.shutdown().await;
	});

	loop {
		tokio::select! {
			line = reader.next_line() => {
				let frame = match line {
					Ok(Some(line)) => serde_json::from_str(&line),
					_ => break,
				};
				match frame {
					Ok(ClientFrame::Stanza(stanza)) => {
						if session.stanzas.send(stanza).is_err() {
							break;
						}
					},
					Ok(ClientFrame::Broker { id, service, request }) => {
						let (reply, ack) = oneshot::channel();
						if session
							.broker
							.send(BrokerCall { service, request, reply })
							.is_err()
						{
							break;
						}
						let out_tx = out_tx.clone();
						spawn_in_span(async move {
							let result = match ack.await {
								Ok(result) => result,
								Err(_) => Err(BrokerError::Disconnected),
							};
							let _ = out_tx.send(BrokerFrame::Ack { id, result });
						});
					},
					Ok(ClientFrame::Hello { .. }) => {
						warn!("ignoring repeated hello");
					},
					Err(error) => {
						warn!("dropping unparsable frame: {error}");
					},
				}
			},
			event = session.events.recv() => {
				let frame = match event {
					Some(Event::Stanza(stanza)) => BrokerFrame::Stanza(stanza),
					Some(Event::PubSubItem { node, payload, retract }) => {
						BrokerFrame::Item { node, payload, retract }
					},
					Some(Event::Disconnected { reason }) => {
						let _ = out_tx.send(BrokerFrame::Bye { reason });
						break;
					},
					None => {
						let _ = out_tx.send(BrokerFrame::Bye {
							reason: "session ended".to_string(),
						});
						break;
					},
				};
				if out_tx.send(frame).is_err() {
					break;
				}
			},
		}
	}
}
