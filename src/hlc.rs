//! Hybrid Logical Clock: monotonic, causally-consistent timestamps used as
//! the primary ordering key across distributed writers (spec.md §4.1).

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::HlcError;

/// A parsed HLC timestamp: wall-clock milliseconds, a logical counter that
/// breaks ties within the same millisecond, and the originating node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub wall_ms: i64,
    pub logical: u32,
    pub node: u16,
}

impl Timestamp {
    /// Formats the timestamp as a fixed-width, byte-wise comparable string:
    /// `wallMs` zero-padded to 15 digits, `logical` to 6 digits, node appended.
    pub fn to_key(self) -> String {
        format!("{:015}:{:06}:{:05}", self.wall_ms, self.logical, self.node)
    }

    /// Parses a timestamp previously produced by [`Timestamp::to_key`].
    pub fn parse(key: &str) -> Option<Timestamp> {
        let mut parts = key.split(':');
        let wall_ms: i64 = parts.next()?.parse().ok()?;
        let logical: u32 = parts.next()?.parse().ok()?;
        let node: u16 = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Timestamp {
            wall_ms,
            logical,
            node,
        })
    }
}

/// Configuration for a [`Clock`] instance.
#[derive(Debug, Clone, Copy)]
pub struct HlcConfig {
    /// Unique id of this node, embedded in every timestamp it mints.
    pub node: u16,
    /// Maximum tolerated skew, in milliseconds, between the locally
    /// observed wall clock and a merged/remote timestamp.
    pub max_offset_ms: i64,
    /// Maximum tolerated single-step forward jump of `last_wall`, in
    /// milliseconds, triggered by a `recv`.
    pub tolerance_ms: i64,
    /// Hard ceiling on the wall-clock reading; exceeding it is a fatal
    /// configuration/environment error.
    pub max_wall_ms: i64,
}

impl Default for HlcConfig {
    fn default() -> Self {
        Self {
            node: 0,
            max_offset_ms: 500,
            tolerance_ms: 60_000,
            // Roughly year 9999 in epoch millis; a sanity ceiling, not a
            // deployment horizon.
            max_wall_ms: 253_402_300_799_000,
        }
    }
}

#[derive(Debug)]
struct State {
    last_wall: i64,
    last_logical: u32,
}

/// Hybrid Logical Clock. Cheap to clone: internal state is a `Mutex`
/// behind no indirection needed by callers, since `now`/`recv` take `&self`.
#[derive(Debug)]
pub struct Clock {
    config: HlcConfig,
    state: Mutex<State>,
    wall_now: fn() -> i64,
}

impl Clock {
    pub fn new(config: HlcConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                last_wall: 0,
                last_logical: 0,
            }),
            wall_now: system_wall_ms,
        }
    }

    /// Test-only constructor allowing the wall-clock reader to be stubbed.
    #[cfg(test)]
    fn with_wall_fn(config: HlcConfig, wall_now: fn() -> i64) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                last_wall: 0,
                last_logical: 0,
            }),
            wall_now,
        }
    }

    pub fn config(&self) -> HlcConfig {
        self.config
    }

    /// Produces a fresh timestamp strictly greater than every timestamp
    /// previously returned by `now`/`recv` on this clock.
    pub fn now(&self) -> Result<Timestamp, HlcError> {
        let wall = (self.wall_now)();
        if wall > self.config.max_wall_ms {
            return Err(HlcError::WallTimeOverflow {
                wall_ms: wall,
                max_wall_ms: self.config.max_wall_ms,
            });
        }

        let mut state = self.state.lock();
        if wall > state.last_wall {
            state.last_wall = wall;
            state.last_logical = 0;
        } else {
            state.last_logical += 1;
        }

        Ok(Timestamp {
            wall_ms: state.last_wall,
            logical: state.last_logical,
            node: self.config.node,
        })
    }

    /// Merges an incoming remote timestamp into the clock, advancing local
    /// state so that the next `now()` compares strictly greater than both
    /// `remote` and every prior local timestamp (spec.md §4.1, §8 property 3).
    pub fn recv(&self, remote: Timestamp) -> Result<Timestamp, HlcError> {
        let wall = (self.wall_now)();
        let mut state = self.state.lock();

        let merged_wall = state.last_wall.max(remote.wall_ms).max(wall);

        let skew_ms = merged_wall - wall;
        if skew_ms > self.config.max_offset_ms {
            return Err(HlcError::ClockOffset {
                skew_ms,
                max_offset_ms: self.config.max_offset_ms,
            });
        }

        let jump_ms = merged_wall - state.last_wall;
        if jump_ms > self.config.tolerance_ms {
            return Err(HlcError::ForwardJump {
                jump_ms,
                tolerance_ms: self.config.tolerance_ms,
            });
        }

        let logical = if merged_wall == state.last_wall && merged_wall == remote.wall_ms {
            state.last_logical.max(remote.logical) + 1
        } else if merged_wall == state.last_wall {
            state.last_logical + 1
        } else if merged_wall == remote.wall_ms {
            remote.logical + 1
        } else {
            0
        };

        state.last_wall = merged_wall;
        state.last_logical = logical;

        Ok(Timestamp {
            wall_ms: merged_wall,
            logical,
            node: self.config.node,
        })
    }
}

fn system_wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}
