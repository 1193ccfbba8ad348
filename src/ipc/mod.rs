//! In-process transport standing in for a POSIX shared-memory + message-
//! queue daemon. Each "virtual process" (worker, combiner, queue, reaper)
//! binds one numeric endpoint; frames are delivered through a bounded
//! `async_channel` registered in a shared [`Registry`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;

const TARGET: &str = "flowrelay::ipc";

pub type EndpointId = u64;

/// A wire frame: `[dst_id: u64 | payload]`. The queue process strips the
/// leading 8 bytes to find its real destination; workers addressing
/// combiners directly never pay the encode/decode cost.
#[derive(Debug, Clone)]
pub struct Frame {
	pub dst: EndpointId,
	pub payload: Bytes,
}

impl Frame {
	pub fn encode(dst: EndpointId, payload: Bytes) -> Bytes {
		let mut buf = BytesMut::with_capacity(8 + payload.len());
		buf.put_u64(dst);
		buf.extend_from_slice(&payload);
		buf.freeze()
	}

	/// Strips the leading 8-byte destination id from a queue-addressed frame.
	pub fn decode(mut bytes: Bytes) -> Option<Frame> {
		if bytes.len() < 8 {
			return None;
		}
		let dst = bytes.get_u64();
		Some(Frame {
			dst,
			payload: bytes,
		})
	}
}

/// Allocates fresh, process-unique endpoint ids.
fn next_endpoint_id() -> EndpointId {
	static COUNTER: AtomicU64 = AtomicU64::new(1);
	COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Shared table of live mailboxes, keyed by endpoint id. Cloning a `Registry`
/// clones the `Arc` handle; all clones see the same table.
#[derive(Clone, Default)]
pub struct Registry {
	inner: Arc<DashMap<EndpointId, async_channel::Sender<Bytes>>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Binds a fresh endpoint with a bounded mailbox of the given capacity
	/// (the high-water mark, `cnf::IPC_HWM` by convention).
	pub fn bind(&self, capacity: usize) -> Endpoint {
		let id = next_endpoint_id();
		let (tx, rx) = async_channel::bounded(capacity.max(1));
		self.inner.insert(id, tx);
		Endpoint {
			id,
			rx,
			registry: self.clone(),
		}
	}

	/// Non-blocking send. Returns `false` if the destination is unknown or
	/// its mailbox is at capacity — both are treated as the same transient
	/// failure.
	pub fn send(&self, dst: EndpointId, payload: Bytes) -> bool {
		match self.inner.get(&dst) {
			Some(tx) => match tx.try_send(payload) {
				Ok(()) => true,
				Err(async_channel::TrySendError::Full(_)) => {
					tracing::trace!(target: TARGET, dst, "mailbox full");
					false
				}
				Err(async_channel::TrySendError::Closed(_)) => {
					tracing::trace!(target: TARGET, dst, "mailbox closed");
					self.inner.remove(&dst);
					false
				}
			},
			None => {
				tracing::trace!(target: TARGET, dst, "unknown endpoint");
				false
			}
		}
	}

	fn unbind(&self, id: EndpointId) {
		self.inner.remove(&id);
	}
}

/// A task's bound mailbox. Deregisters itself from the [`Registry`] on drop
/// so a later send to this id fails cleanly instead of silently queuing.
pub struct Endpoint {
	pub id: EndpointId,
	rx: async_channel::Receiver<Bytes>,
	registry: Registry,
}

impl Endpoint {
	pub fn id(&self) -> EndpointId {
		self.id
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// Non-blocking send to another endpoint through the shared registry.
	pub fn send(&self, dst: EndpointId, payload: Bytes) -> bool {
		self.registry.send(dst, payload)
	}

	/// Waits up to `timeout` for the next frame addressed to this endpoint.
	/// Returns `None` on timeout or if the registry side has been torn down.
	pub async fn recv(&self, timeout: Duration) -> Option<Bytes> {
		match tokio::time::timeout(timeout, self.rx.recv()).await {
			Ok(Ok(bytes)) => Some(bytes),
			Ok(Err(_)) => None,
			Err(_) => None,
		}
	}

	/// Blocks indefinitely for the next frame; used inside `tokio::select!`
	/// alongside a `CancellationToken` rather than alongside a manual timeout.
	pub async fn recv_indefinite(&self) -> Option<Bytes> {
		self.rx.recv().await.ok()
	}
}

impl Drop for Endpoint {
	fn drop(&mut self) {
		self.registry.unbind(self.id);
	}
}
