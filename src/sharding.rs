use std::fmt;
use std::num::NonZeroU32;
use uuid::Uuid;

const CHANNEL_PREFIX: &str = "group";

/// A partition of conversation traffic, always in `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardGroup(u32);

impl ShardGroup {
    pub fn index(self) -> u32 {
        self.0
    }

    /// Pub/sub channel carrying this group's traffic (`group0`, `group1`, ...).
    pub fn channel_name(self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ShardGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps conversations onto shard groups.
///
/// Stateless: the group is the conversation id's 16 bytes read as a big-endian
/// unsigned integer, reduced modulo the group count. Every process configured with
/// the same count therefore agrees on the channel for a conversation without any
/// coordination.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    group_count: NonZeroU32,
}

impl ShardRouter {
    pub fn new(group_count: NonZeroU32) -> Self {
        Self { group_count }
    }

    /// Router for a configured count; `None` when the count is zero.
    pub fn with_count(group_count: u32) -> Option<Self> {
        NonZeroU32::new(group_count).map(Self::new)
    }

    pub fn group_count(&self) -> u32 {
        self.group_count.get()
    }

    pub fn group_of(&self, conversation_id: Uuid) -> ShardGroup {
        let n = u128::from(self.group_count.get());
        // bounded by n, fits in u32
        ShardGroup((conversation_id.as_u128() % n) as u32)
    }

    /// Resolve a raw group number, rejecting anything outside `[0, N)`.
    pub fn group(&self, index: u32) -> Option<ShardGroup> {
        (index < self.group_count.get()).then_some(ShardGroup(index))
    }

    pub fn groups(&self) -> impl Iterator<Item = ShardGroup> {
        (0..self.group_count.get()).map(ShardGroup)
    }
}
