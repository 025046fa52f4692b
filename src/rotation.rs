// src/rotation.rs
// Relayer rotation: which BMR may submit in which destination height window

use crate::chain::{BmcLinkStatus, RelayMessage};

/// A rotation window on the destination chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Index of the BMR allowed to relay in this window.
    pub index: usize,
    /// First destination height of the window.
    pub start: u64,
    pub end: u64,
}

/// What the scheduler does with a buffered message on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Segment and submit now.
    Relay,
    /// Bare block updates, held until receipts need them.
    Defer,
    /// Stop here: not this relayer's turn and nobody else's has passed.
    Wait,
}

/// Rotation window containing destination height `height`.
///
/// Windows are `rotate_term` blocks long. The window ending at
/// `rotate_height` belongs to `bmr_index`; every later window hands over
/// to the next BMR, round-robin.
///
/// # Returns
/// `None` when rotation is disabled or no BMR is registered.
pub fn window_at(status: &BmcLinkStatus, height: u64) -> Option<Window> {
    if status.rotate_term <= 0 || status.bmrs.is_empty() {
        return None;
    }
    let term = status.rotate_term as u64;
    let rotations = if height < status.rotate_height {
        0
    } else {
        (height - status.rotate_height) / term + 1
    };
    let index = ((status.bmr_index as u64 + rotations) % status.bmrs.len() as u64) as usize;
    let start = if rotations == 0 {
        status.rotate_height.saturating_sub(term)
    } else {
        status.rotate_height + (rotations - 1) * term
    };
    Some(Window {
        index,
        start,
        end: start + term,
    })
}

/// Whether this relayer must send now.
///
/// # Arguments
/// * `status` - Latest link status
/// * `my_index` - This relayer's position in `status.bmrs`
/// * `finalize_latency` - Destination blocks a relay needs to finalize
/// * `block_updates` - Block updates accumulated in the candidate message
pub fn relayable(
    status: &BmcLinkStatus,
    my_index: Option<usize>,
    finalize_latency: u64,
    block_updates: usize,
) -> bool {
    let Some(my) = my_index else {
        return false;
    };
    let next = status.current_height + 1;
    let Some(window) = window_at(status, next) else {
        return false;
    };
    if window.index != my || next < window.start + finalize_latency {
        return false;
    }
    let aggregated = status.max_aggregation > 0 && block_updates as i64 >= status.max_aggregation;
    status.current_height >= status.rotate_height || aggregated
}

/// Whether another relayer already had its chance at `rm`.
pub fn skippable(
    status: &BmcLinkStatus,
    my_index: Option<usize>,
    finalize_latency: u64,
    rm: &RelayMessage,
) -> bool {
    let Some(window) = window_at(status, rm.dst_height) else {
        return rm.receipt_proofs.is_empty();
    };
    my_index != Some(window.index) && status.current_height >= window.start + finalize_latency
}

/// Combine the two predicates. A message is sent when it is this relayer's
/// turn, or when another relayer's turn for it has passed. With rotation
/// disabled, receipts are always sent and bare block updates are deferred.
pub fn decide(
    status: &BmcLinkStatus,
    my_index: Option<usize>,
    finalize_latency: u64,
    rm: &RelayMessage,
) -> Decision {
    if status.rotate_term <= 0 {
        return if rm.receipt_proofs.is_empty() {
            Decision::Defer
        } else {
            Decision::Relay
        };
    }
    if skippable(status, my_index, finalize_latency, rm)
        || relayable(status, my_index, finalize_latency, rm.block_updates.len())
    {
        Decision::Relay
    } else {
        Decision::Wait
    }
}

/// Project a source height onto the destination chain from a reference
/// pair sampled at the last status refresh and the configured block intervals.
/// Rounds up. This is a heuristic, only used to place messages in rotation windows.
pub fn estimate_dst_height(
    dst_ref: u64,
    src_ref: u64,
    src_height: u64,
    src_interval_ms: u64,
    dst_interval_ms: u64,
) -> u64 {
    if src_height <= src_ref || dst_interval_ms == 0 {
        return dst_ref;
    }
    let elapsed = (src_height - src_ref).saturating_mul(src_interval_ms);
    dst_ref + (elapsed + dst_interval_ms - 1) / dst_interval_ms
}
