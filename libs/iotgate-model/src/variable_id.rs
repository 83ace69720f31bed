//! Variable ID scheme
//!
//! Numeric IDs are partitioned into a small system range and a large custom
//! range. String IDs have the form `<kind>-<device>-<local>[-<index>]`, for
//! example `DV-PLC001-TEMP01` or `DV-PLC001-AI-3`.

use std::fmt;
use std::str::FromStr;

use errors::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

pub const MIN_SYSTEM_ID: u64 = 1;
pub const MAX_SYSTEM_ID: u64 = 99_999;
pub const MIN_CUSTOM_ID: u64 = 100_000;
pub const MAX_CUSTOM_ID: u64 = 999_999_999;

/// Which range a numeric ID falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    System,
    Custom,
    Unknown,
}

pub fn id_kind(id: u64) -> IdKind {
    match id {
        MIN_SYSTEM_ID..=MAX_SYSTEM_ID => IdKind::System,
        MIN_CUSTOM_ID..=MAX_CUSTOM_ID => IdKind::Custom,
        _ => IdKind::Unknown,
    }
}

pub fn is_valid_id(id: u64) -> bool {
    id_kind(id) != IdKind::Unknown
}

// ============================================================================
// IdGenerator
// ============================================================================

struct GeneratorState {
    last_system: u64,
    last_custom: u64,
    used: FxHashSet<u64>,
}

/// Allocator for numeric variable IDs
///
/// Allocation scans forward from the last handed-out ID and skips IDs marked
/// used. Released IDs below the cursor are not revisited until the cursor
/// wraps, which it never does: the pool reports exhaustion instead.
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_system: MIN_SYSTEM_ID - 1,
                last_custom: MIN_CUSTOM_ID - 1,
                used: FxHashSet::default(),
            }),
        }
    }

    pub fn next_system_id(&self) -> GatewayResult<u64> {
        let mut state = self.state.lock();
        let start = state.last_system + 1;
        for id in start..=MAX_SYSTEM_ID {
            if state.used.insert(id) {
                state.last_system = id;
                return Ok(id);
            }
        }
        Err(GatewayError::Internal("system ID pool exhausted".to_string()))
    }

    pub fn next_custom_id(&self) -> GatewayResult<u64> {
        let mut state = self.state.lock();
        let start = state.last_custom + 1;
        for id in start..=MAX_CUSTOM_ID {
            if state.used.insert(id) {
                state.last_custom = id;
                return Ok(id);
            }
        }
        Err(GatewayError::Internal("custom ID pool exhausted".to_string()))
    }

    /// Record an externally chosen ID and advance the matching cursor past it
    pub fn mark_used(&self, id: u64) {
        let mut state = self.state.lock();
        state.used.insert(id);
        match id_kind(id) {
            IdKind::System if id > state.last_system => state.last_system = id,
            IdKind::Custom if id > state.last_custom => state.last_custom = id,
            _ => {},
        }
    }

    pub fn release(&self, id: u64) {
        self.state.lock().used.remove(&id);
    }

    pub fn is_used(&self, id: u64) -> bool {
        self.state.lock().used.contains(&id)
    }
}

// ============================================================================
// StringId
// ============================================================================

/// Parsed form of a semantic string ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StringId {
    /// Kind prefix, e.g. `DV` (device variable) or `SV` (system variable)
    pub kind: String,
    pub device_id: String,
    /// Local name; may itself contain hyphens
    pub local_name: String,
    /// Optional array index, only when the last segment is a canonical decimal
    pub index: Option<u32>,
}

/// A decimal without sign or leading zeros ("0" itself is canonical)
fn canonical_index(segment: &str) -> Option<u32> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse().ok()
}

impl StringId {
    /// Build a string ID that prints back to exactly these parts
    ///
    /// Kind and device must be non-empty and hyphen-free. A local name
    /// ending in `-<canonical decimal>` is rejected, since it would read back
    /// as an index; use [`StringId::with_index`] for that.
    pub fn new(
        kind: impl Into<String>,
        device_id: impl Into<String>,
        local_name: impl Into<String>,
    ) -> GatewayResult<Self> {
        let (kind, device_id, local_name) = (kind.into(), device_id.into(), local_name.into());
        let invalid = |field: &str, reason: &str| GatewayError::invalid_parameter(field, reason.to_string());

        for (field, part) in [("kind", &kind), ("device_id", &device_id)] {
            if part.is_empty() || part.contains('-') {
                return Err(invalid(field, "must be non-empty without '-'"));
            }
        }
        if local_name.is_empty() {
            return Err(invalid("local_name", "must not be empty"));
        }
        if let Some((head, last)) = local_name.rsplit_once('-') {
            if !head.is_empty() && canonical_index(last).is_some() {
                return Err(invalid(
                    "local_name",
                    &format!("'{}' ends in an index segment", local_name),
                ));
            }
        }

        Ok(Self {
            kind,
            device_id,
            local_name,
            index: None,
        })
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn parse(s: &str) -> GatewayResult<Self> {
        let invalid = |reason: &str| {
            GatewayError::invalid_parameter("string_id", format!("'{}': {}", s, reason))
        };

        let mut parts = s.splitn(3, '-');
        let kind = parts.next().unwrap_or_default();
        let device_id = parts.next().unwrap_or_default();
        let rest = parts
            .next()
            .ok_or_else(|| invalid("expected <kind>-<device>-<local>[-<index>]"))?;

        if kind.is_empty() {
            return Err(invalid("empty kind"));
        }
        if device_id.is_empty() {
            return Err(invalid("empty device"));
        }

        // Only split off an index when something remains for the local name
        let (local_name, index) = match rest.rsplit_once('-') {
            Some((local, last)) if !local.is_empty() => match canonical_index(last) {
                Some(idx) => (local, Some(idx)),
                None => (rest, None),
            },
            _ => (rest, None),
        };

        if local_name.is_empty() {
            return Err(invalid("empty local name"));
        }

        Ok(Self {
            kind: kind.to_string(),
            device_id: device_id.to_string(),
            local_name: local_name.to_string(),
            index,
        })
    }
}

impl fmt::Display for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind, self.device_id, self.local_name)?;
        if let Some(idx) = self.index {
            write!(f, "-{}", idx)?;
        }
        Ok(())
    }
}

impl FromStr for StringId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
