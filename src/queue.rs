//! Queue process: the pending-frame retry layer sitting between a worker (or
//! combiner) and its real destination when that destination is back-
//! pressured.
//!
//! A queue-addressed frame carries its real destination in the wire header
//! (`ipc::Frame`); on first-attempt send failure the frame is held and
//! retried every outer iteration until it succeeds or the process is asked
//! to stop.
//!
//! The pending table is keyed by [`PendingSeq`], a locally-generated
//! monotonic counter — never the payload's content or its destination, both
//! of which can repeat.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::cnf;
use crate::ipc::{self, EndpointId, Frame};

type PendingSeq = u64;

struct PendingFrame {
	dst: EndpointId,
	payload: Bytes,
}

/// One queue process. Binds a single inbox; every frame it receives there is
/// addressed (via the 8-byte wire header) to the frame's real destination.
pub struct Queue {
	pub task_id: u32,
	endpoint: ipc::Endpoint,
	pending: BTreeMap<PendingSeq, PendingFrame>,
	next_seq: PendingSeq,
	pending_bytes: usize,
	cancel: CancellationToken,
}

impl Queue {
	pub fn new(task_id: u32, endpoint: ipc::Endpoint, cancel: CancellationToken) -> Self {
		Queue {
			task_id,
			endpoint,
			pending: BTreeMap::new(),
			next_seq: 0,
			pending_bytes: 0,
			cancel,
		}
	}

	pub fn endpoint_id(&self) -> EndpointId {
		self.endpoint.id()
	}

	pub async fn run(mut self) {
		loop {
			if self.tick().await {
				break;
			}
		}
	}

	/// One outer iteration: retry everything pending, keep retrying without
	/// reading new input while over the memory ceiling (bounded by
	/// `MAX_QUEUE_FLUSH_ATTEMPTS` to avoid spinning forever against a dead
	/// destination), then poll the inbox — with a zero timeout if anything
	/// is still pending so the next retry pass runs promptly.
	pub async fn tick(&mut self) -> bool {
		if self.cancel.is_cancelled() {
			return true;
		}

		let mut remaining = self.retry_pending();

		let mem_ceiling = *cnf::QUEUE_MEM_KIB * 1024;
		let mut flush_attempts = 0u32;
		while self.pending_bytes >= mem_ceiling && flush_attempts < cnf::MAX_QUEUE_FLUSH_ATTEMPTS {
			remaining = self.retry_pending();
			flush_attempts += 1;
		}

		let timeout = if remaining > 0 {
			Duration::from_millis(0)
		} else {
			Duration::from_millis(*cnf::QUEUE_RECV_TIMEOUT_MS)
		};

		tokio::select! {
			_ = self.cancel.cancelled() => return true,
			frame = self.endpoint.recv(timeout) => {
				if let Some(bytes) = frame {
					self.handle_frame(bytes);
				}
			}
		}
		false
	}

	fn handle_frame(&mut self, bytes: Bytes) {
		let Some(frame) = Frame::decode(bytes) else {
			tracing::warn!(target: "flowrelay::queue", task = self.task_id, "dropped undersized frame");
			return;
		};
		if !self.endpoint.send(frame.dst, frame.payload.clone()) {
			let seq = self.next_seq;
			self.next_seq += 1;
			self.pending_bytes += frame.payload.len();
			self.pending.insert(seq, PendingFrame { dst: frame.dst, payload: frame.payload });
		}
	}

	/// Walks every pending entry in sequence order, retrying its send.
	/// Entries that succeed this pass are dropped from the table. Returns
	/// the number still pending afterward.
	fn retry_pending(&mut self) -> usize {
		let mut sent = Vec::new();
		for (&seq, entry) in self.pending.iter() {
			if self.endpoint.send(entry.dst, entry.payload.clone()) {
				sent.push(seq);
			}
		}
		for seq in sent {
			if let Some(entry) = self.pending.remove(&seq) {
				self.pending_bytes -= entry.payload.len();
			}
		}
		self.pending.len()
	}

	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame_for(dst: EndpointId, payload: &[u8]) -> Bytes {
		Frame::encode(dst, Bytes::copy_from_slice(payload))
	}

	#[tokio::test]
	async fn forwards_a_frame_that_sends_cleanly() {
		let registry = ipc::Registry::new();
		let dst_ep = registry.bind(8);
		let queue_ep = registry.bind(8);
		let mut queue = Queue::new(0, queue_ep, CancellationToken::new());

		registry.send(queue.endpoint_id(), frame_for(dst_ep.id(), b"hello"));
		queue.tick().await;

		let got = dst_ep.recv(Duration::from_millis(100)).await;
		assert_eq!(got, Some(Bytes::from_static(b"hello")));
		assert_eq!(queue.pending_count(), 0);
	}

	#[tokio::test]
	async fn holds_and_retries_a_frame_whose_destination_is_full() {
		let registry = ipc::Registry::new();
		let dst_ep = registry.bind(1);
		registry.send(dst_ep.id(), Bytes::from_static(b"already-full"));
		let queue_ep = registry.bind(8);
		let mut queue = Queue::new(0, queue_ep, CancellationToken::new());

		registry.send(queue.endpoint_id(), frame_for(dst_ep.id(), b"retry-me"));
		queue.tick().await;
		assert_eq!(queue.pending_count(), 1);

		let drained = dst_ep.recv(Duration::from_millis(10)).await;
		assert_eq!(drained, Some(Bytes::from_static(b"already-full")));

		queue.tick().await;
		assert_eq!(queue.pending_count(), 0);
		let got = dst_ep.recv(Duration::from_millis(10)).await;
		assert_eq!(got, Some(Bytes::from_static(b"retry-me")));
	}

	#[tokio::test]
	async fn undersized_frame_is_dropped_without_panicking() {
		let registry = ipc::Registry::new();
		let queue_ep = registry.bind(8);
		let mut queue = Queue::new(0, queue_ep, CancellationToken::new());
		registry.send(queue.endpoint_id(), Bytes::from_static(b"x"));
		queue.tick().await;
		assert_eq!(queue.pending_count(), 0);
	}

	#[tokio::test]
	async fn cancellation_stops_the_loop() {
		let registry = ipc::Registry::new();
		let queue_ep = registry.bind(8);
		let cancel = CancellationToken::new();
		let mut queue = Queue::new(0, queue_ep, cancel.clone());
		cancel.cancel();
		assert!(queue.tick().await);
	}
}
