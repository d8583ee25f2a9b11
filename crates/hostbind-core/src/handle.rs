use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Opaque identity of a native resource (pointer-equivalent).
///
/// The manager compares and hashes handles but never dereferences them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "HandleRepr")]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Accepts `0x`-prefixed hex or plain decimal.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let v = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok()?,
            None => s.parse::<u64>().ok()?,
        };
        Some(NativeHandle(v))
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for NativeHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HandleRepr {
    Num(u64),
    Text(String),
}

impl TryFrom<HandleRepr> for NativeHandle {
    type Error = String;

    fn try_from(repr: HandleRepr) -> Result<Self, Self::Error> {
        match repr {
            HandleRepr::Num(v) => Ok(NativeHandle(v)),
            HandleRepr::Text(s) => {
                NativeHandle::parse(&s).ok_or_else(|| format!("invalid native handle: {s:?}"))
            }
        }
    }
}

/// Reference to a live proxy slot.
///
/// Slots are reused; the generation distinguishes a reused slot from the proxy
/// that previously lived there, so stale references are detected rather than
/// aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyRef {
    index: u32,
    generation: u32,
}

impl ProxyRef {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}.{}", self.index, self.generation)
    }
}

impl Serialize for ProxyRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
