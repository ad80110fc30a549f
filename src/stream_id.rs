use crate::error::{Result, YamuxError};
use crate::frame::SESSION_STREAM_ID;
use std::sync::atomic::{AtomicU32, Ordering};

/// Allocates stream ids by role parity: odd for clients, even for servers.
///
/// Ids only ever grow; once the space is exhausted the session has to be
/// replaced.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU32,
    is_client: bool,
}

impl StreamIdGenerator {
    pub fn new(is_client: bool) -> Self {
        let initial_id = if is_client { 1 } else { 2 };
        Self {
            next_id: AtomicU32::new(initial_id),
            is_client,
        }
    }

    pub fn next(&self) -> Result<u32> {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            // The counter saturates instead of wrapping so an id is never
            // handed out twice.
            let Some(following) = current.checked_add(2) else {
                return Err(YamuxError::StreamIdsExhausted);
            };
            match self.next_id.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Whether `stream_id` has the parity this side allocates.
    pub fn is_local(&self, stream_id: u32) -> bool {
        (stream_id % 2 == 1) == self.is_client
    }

    /// Checks that an inbound SYN uses the peer's parity.
    pub fn validate_peer_stream_id(&self, stream_id: u32) -> Result<()> {
        if stream_id == SESSION_STREAM_ID || self.is_local(stream_id) {
            return Err(YamuxError::InvalidStreamId(stream_id));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_stream_id_generation() {
        let generator = StreamIdGenerator::new(true);

        // Client should generate odd IDs starting from 1
        assert_eq!(generator.next().unwrap(), 1);
        assert_eq!(generator.next().unwrap(), 3);
        assert_eq!(generator.next().unwrap(), 5);
        assert_eq!(generator.next().unwrap(), 7);
    }

    #[test]
    fn test_server_stream_id_generation() {
        let generator = StreamIdGenerator::new(false);

        // Server should generate even IDs starting from 2
        assert_eq!(generator.next().unwrap(), 2);
        assert_eq!(generator.next().unwrap(), 4);
        assert_eq!(generator.next().unwrap(), 6);
        assert_eq!(generator.next().unwrap(), 8);
    }

    #[test]
    fn test_stream_id_exhaustion() {
        let generator = StreamIdGenerator::new(true);
        generator.next_id.store(u32::MAX - 2, Ordering::Relaxed);

        assert_eq!(generator.next().unwrap(), u32::MAX - 2);
        // u32::MAX itself cannot be followed, so allocation stops
        assert!(matches!(
            generator.next(),
            Err(YamuxError::StreamIdsExhausted)
        ));
        assert!(generator.next().is_err());
    }

    #[test]
    fn test_is_local() {
        let client = StreamIdGenerator::new(true);
        let server = StreamIdGenerator::new(false);

        assert!(client.is_local(1));
        assert!(!client.is_local(2));
        assert!(server.is_local(2));
        assert!(!server.is_local(3));
    }

    #[test]
    fn test_peer_stream_id_validation() {
        let client_generator = StreamIdGenerator::new(true);
        let server_generator = StreamIdGenerator::new(false);

        // Client should accept server-initiated (even) IDs
        assert!(client_generator.validate_peer_stream_id(2).is_ok());
        assert!(client_generator.validate_peer_stream_id(100).is_ok());

        // Client should reject client-initiated (odd) peer IDs
        assert!(client_generator.validate_peer_stream_id(1).is_err());
        assert!(client_generator.validate_peer_stream_id(99).is_err());

        // Server should accept client-initiated (odd) IDs
        assert!(server_generator.validate_peer_stream_id(1).is_ok());
        assert!(server_generator.validate_peer_stream_id(99).is_ok());

        // Server should reject server-initiated (even) peer IDs
        assert!(matches!(
            server_generator.validate_peer_stream_id(4),
            Err(YamuxError::InvalidStreamId(4))
        ));

        // Both should reject the session stream ID
        assert!(client_generator.validate_peer_stream_id(0).is_err());
        assert!(server_generator.validate_peer_stream_id(0).is_err());
    }

    #[test]
    fn test_concurrent_id_generation() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(StreamIdGenerator::new(true));
        let mut handles = vec![];

        for _ in 0..20 {
            let generator_clone = Arc::clone(&generator);
            let handle = thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..50 {
                    if let Ok(id) = generator_clone.next() {
                        ids.push(id);
                    }
                }
                ids
            });
            handles.push(handle);
        }

        let mut all_ids = Vec::new();
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        let mut unique_ids = HashSet::new();
        for id in &all_ids {
            assert_eq!(id % 2, 1, "All client IDs should be odd, found {id}");
            assert!(unique_ids.insert(*id), "Duplicate client ID: {id}");
        }
        assert_eq!(all_ids.len(), 1000);

        // No gaps either: ids are exactly 1, 3, ..., 1999
        let mut sorted_ids: Vec<_> = unique_ids.into_iter().collect();
        sorted_ids.sort();
        assert_eq!(sorted_ids[0], 1);
        assert_eq!(*sorted_ids.last().unwrap(), 1999);
    }
}
