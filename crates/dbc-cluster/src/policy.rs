//! Node removal policy

/// Consecutive failures after which the only node of a cluster is replaced
pub const SINGLE_NODE_FAILURE_THRESHOLD: u32 = 5;

/// Health of a node as observed during one tend cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHealth {
    pub active: bool,
    pub failures: u32,
    pub friends: u32,
    pub owns_partitions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Remove,
    /// Remove only if the seeds yield a replacement
    RemoveIfReseeded,
}

/// Decide what to do with a node.
///
/// `refresh_count` is the number of nodes refreshed successfully in the
/// current cycle. Friend counts only mean something when other nodes were
/// refreshed, so larger clusters wait for enough successful refreshes
/// before removing anybody.
pub fn evaluate(cluster_size: usize, health: NodeHealth, refresh_count: usize) -> Verdict {
    if !health.active {
        return Verdict::Remove;
    }

    match cluster_size {
        0 | 1 => {
            if health.failures >= SINGLE_NODE_FAILURE_THRESHOLD {
                Verdict::RemoveIfReseeded
            } else {
                Verdict::Keep
            }
        }
        2 => {
            if refresh_count >= 1 && health.friends == 0 && health.failures > 0 {
                Verdict::Remove
            } else {
                Verdict::Keep
            }
        }
        _ => {
            if refresh_count >= 2
                && health.friends == 0
                && (health.failures > 0 || !health.owns_partitions)
            {
                Verdict::Remove
            } else {
                Verdict::Keep
            }
        }
    }
}
