//! Work messages and the tag registry.

use std::any::TypeId;
use std::collections::HashMap;

use crate::communicator::CommHandle;
use crate::error::{CommError, WorkError};
use crate::Tag;

/// Delivery pattern of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    /// One destination rank
    P2p,
    /// Every rank, the sender included
    BroadcastIncludingSelf,
    /// Every rank except the sender
    BroadcastExcludingSelf,
}

/// A unit of cross-rank work, executed against the receiving rank's worker.
///
/// Actions consume the message. They run on the execution thread and may
/// mutate the worker freely; anything they send goes through `comm`.
pub trait Work<W>: Send + 'static {
    /// Serialize the payload. The tag is supplied by the registry.
    fn serialize(&self) -> Vec<u8>;

    /// Run on the receiving rank.
    fn action(self: Box<Self>, worker: &mut W, comm: &CommHandle<W>) -> Result<(), WorkError>;
}

/// A concrete message kind that can be registered and rebuilt from bytes.
pub trait WorkKind<W>: Work<W> + Sized {
    /// Stable name, used for logging and the registry fingerprint
    const NAME: &'static str;

    /// Rebuild a message from exactly the bytes `serialize` produced.
    fn deserialize(payload: &[u8]) -> Result<Self, WorkError>;
}

type DecodeFn<W> = fn(&[u8]) -> Result<Box<dyn Work<W>>, WorkError>;

struct Entry<W> {
    name: &'static str,
    decode: DecodeFn<W>,
}

fn decode_boxed<W: 'static, K: WorkKind<W>>(payload: &[u8]) -> Result<Box<dyn Work<W>>, WorkError> {
    Ok(Box::new(K::deserialize(payload)?))
}

/// Maps tags to deserializers.
///
/// Tags are handed out in registration order, so every rank must register
/// the same kinds in the same order. [`Registry::fingerprint`] lets ranks
/// check that before any work flows.
pub struct Registry<W> {
    entries: Vec<Entry<W>>,
    by_type: HashMap<TypeId, Tag>,
}

impl<W: 'static> Registry<W> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Register a message kind and return its tag.
    ///
    /// Registering the same kind twice returns the existing tag.
    pub fn register<K: WorkKind<W>>(&mut self) -> Tag {
        let type_id = TypeId::of::<K>();
        if let Some(&tag) = self.by_type.get(&type_id) {
            return tag;
        }
        let tag = self.entries.len() as Tag;
        self.entries.push(Entry {
            name: K::NAME,
            decode: decode_boxed::<W, K>,
        });
        self.by_type.insert(type_id, tag);
        log::debug!("registered {} as tag {}", K::NAME, tag);
        tag
    }

    /// Tag of a registered kind.
    pub fn tag_of<K: WorkKind<W>>(&self) -> Result<Tag, CommError> {
        self.by_type
            .get(&TypeId::of::<K>())
            .copied()
            .ok_or(CommError::Unregistered(K::NAME))
    }

    /// Name registered under `tag`.
    pub fn name(&self, tag: Tag) -> Option<&'static str> {
        self.entries.get(tag as usize).map(|e| e.name)
    }

    /// Whether `tag` has a deserializer.
    pub fn contains(&self, tag: Tag) -> bool {
        (tag as usize) < self.entries.len()
    }

    /// Rebuild a message received under `tag`.
    pub fn decode(&self, tag: Tag, payload: &[u8]) -> Result<Box<dyn Work<W>>, WorkError> {
        let entry = self
            .entries
            .get(tag as usize)
            .ok_or_else(|| WorkError::Invalid(format!("unknown tag {}", tag)))?;
        (entry.decode)(payload)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// FNV-1a hash of the registered names in tag order.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        for entry in &self.entries {
            for byte in entry.name.bytes().chain(std::iter::once(0)) {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        }
        hash
    }
}

impl<W: 'static> Default for Registry<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        hits: u32,
    }

    struct Add(u32);

    impl Work<Counter> for Add {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn action(self: Box<Self>, worker: &mut Counter, _comm: &CommHandle<Counter>) -> Result<(), WorkError> {
            worker.hits += self.0;
            Ok(())
        }
    }

    impl WorkKind<Counter> for Add {
        const NAME: &'static str = "Add";

        fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
            let bytes: [u8; 4] = payload.try_into().map_err(|_| WorkError::PayloadSize {
                expected: 4,
                actual: payload.len(),
            })?;
            Ok(Add(u32::from_le_bytes(bytes)))
        }
    }

    struct Ping;

    impl Work<Counter> for Ping {
        fn serialize(&self) -> Vec<u8> {
            Vec::new()
        }

        fn action(self: Box<Self>, _worker: &mut Counter, _comm: &CommHandle<Counter>) -> Result<(), WorkError> {
            Ok(())
        }
    }

    impl WorkKind<Counter> for Ping {
        const NAME: &'static str = "Ping";

        fn deserialize(_payload: &[u8]) -> Result<Self, WorkError> {
            Ok(Ping)
        }
    }

    #[test]
    fn test_tags_follow_registration_order() {
        let mut registry = Registry::<Counter>::new();
        assert_eq!(registry.register::<Add>(), 0);
        assert_eq!(registry.register::<Ping>(), 1);
        assert_eq!(registry.register::<Add>(), 0);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tag_of::<Ping>().unwrap(), 1);
        assert_eq!(registry.name(0), Some("Add"));
        assert!(!registry.contains(2));
    }

    #[test]
    fn test_unregistered_kind() {
        let registry = Registry::<Counter>::new();
        assert!(matches!(
            registry.tag_of::<Add>(),
            Err(CommError::Unregistered("Add"))
        ));
    }

    #[test]
    fn test_decode_dispatches_by_tag() {
        let mut registry = Registry::<Counter>::new();
        let tag = registry.register::<Add>();

        assert!(registry.decode(tag, &7u32.to_le_bytes()).is_ok());
        assert!(registry.decode(tag, &[1, 2]).is_err());
        assert!(registry.decode(5, &[]).is_err());
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let mut a = Registry::<Counter>::new();
        a.register::<Add>();
        a.register::<Ping>();

        let mut b = Registry::<Counter>::new();
        b.register::<Ping>();
        b.register::<Add>();

        let mut c = Registry::<Counter>::new();
        c.register::<Add>();
        c.register::<Ping>();

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
    }
}
