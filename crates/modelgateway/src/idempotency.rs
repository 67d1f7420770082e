//! Idempotency replay. The core only depends on the `IdempotencyStore`
//! contract; the in-memory implementation here serves single-instance
//! deployments and tests, and a remote key-value store can replace it behind
//! the same trait.
//!
//! Semantics are first-writer-wins: the first completed response is stored
//! and replayed for the lifetime of the window. Concurrent duplicates may
//! each execute upstream; whichever finishes first becomes the stored
//! answer. Streaming responses are never stored.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::*;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_KEY_LEN: usize = 255;

/// Replay is keyed by (principal, endpoint, client key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
	pub principal: Strng,
	pub endpoint: Strng,
	pub key: String,
}

#[derive(Debug, Clone)]
pub struct StoredResponse {
	pub status: u16,
	pub body: Bytes,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
	/// A previously stored response for this key, if the window has not
	/// lapsed.
	async fn get(&self, key: &IdempotencyKey) -> Option<StoredResponse>;
	/// Store the response unless an earlier writer already did.
	async fn put(&self, key: IdempotencyKey, response: StoredResponse);
}

pub struct MemoryIdempotencyStore {
	window: Duration,
	entries: Mutex<HashMap<IdempotencyKey, (StoredResponse, Instant)>>,
}

impl MemoryIdempotencyStore {
	pub fn new(window: Duration) -> MemoryIdempotencyStore {
		MemoryIdempotencyStore {
			window,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub fn gc(&self, now: Instant) {
		let window = self.window;
		self
			.entries
			.lock()
			.retain(|_, (_, stored_at)| now.saturating_duration_since(*stored_at) < window);
	}
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
	async fn get(&self, key: &IdempotencyKey) -> Option<StoredResponse> {
		let entries = self.entries.lock();
		let (response, stored_at) = entries.get(key)?;
		if stored_at.elapsed() >= self.window {
			return None;
		}
		Some(response.clone())
	}

	async fn put(&self, key: IdempotencyKey, response: StoredResponse) {
		self
			.entries
			.lock()
			.entry(key)
			.or_insert_with(|| (response, Instant::now()));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(k: &str) -> IdempotencyKey {
		IdempotencyKey {
			principal: strng::new("alice"),
			endpoint: strng::new("/v1/chat/completions"),
			key: k.to_string(),
		}
	}

	fn response(body: &str) -> StoredResponse {
		StoredResponse {
			status: 200,
			body: Bytes::copy_from_slice(body.as_bytes()),
		}
	}

	#[tokio::test]
	async fn first_writer_wins() {
		let store = MemoryIdempotencyStore::new(DEFAULT_WINDOW);
		store.put(key("k1"), response("first")).await;
		store.put(key("k1"), response("second")).await;
		let got = store.get(&key("k1")).await.unwrap();
		assert_eq!(got.body, Bytes::from_static(b"first"));
	}

	#[tokio::test]
	async fn keys_are_scoped_by_principal() {
		let store = MemoryIdempotencyStore::new(DEFAULT_WINDOW);
		store.put(key("k1"), response("alice's")).await;
		let mut other = key("k1");
		other.principal = strng::new("bob");
		assert!(store.get(&other).await.is_none());
	}

	#[tokio::test]
	async fn gc_expires_entries() {
		let store = MemoryIdempotencyStore::new(Duration::from_secs(10));
		store.put(key("k1"), response("x")).await;
		store.gc(Instant::now() + Duration::from_secs(11));
		assert!(store.get(&key("k1")).await.is_none());
	}
}
