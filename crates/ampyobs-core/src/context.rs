//! Correlation context - the identity carried along one causal chain
//!
//! A [`CorrelationContext`] is passed explicitly through every call that starts
//! a span, emits a log or records a metric. It bundles the W3C-style span
//! identity (trace id, span id, trace flags) with the domain identifiers that
//! tie a chain of work together (run, universe, message, order, instrument).
//!
//! The identity is either entirely absent (a root, to be generated on first
//! use) or entirely present and valid. There is no way to build a context
//! with only one of the two ids.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 128-bit trace identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// The all-zero id, never valid on the wire
    pub const INVALID: TraceId = TraceId([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != [0; 16]
    }

    /// Low 64 bits, big-endian. Used for deterministic sampling.
    pub fn low_u64(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(low)
    }

    /// Parse exactly 32 lowercase hex characters
    pub fn from_hex(s: &str) -> Option<Self> {
        parse_lower_hex::<16>(s).map(Self)
    }
}

/// 64-bit span identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// The all-zero id, never valid on the wire
    pub const INVALID: SpanId = SpanId([0; 8]);

    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != [0; 8]
    }

    /// Parse exactly 16 lowercase hex characters
    pub fn from_hex(s: &str) -> Option<Self> {
        parse_lower_hex::<8>(s).map(Self)
    }
}

fn parse_lower_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}

macro_rules! hex_id_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $ty::from_hex(&s).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid {}: {}", stringify!($ty), s))
                })
            }
        }
    };
}

hex_id_impls!(TraceId);
hex_id_impls!(SpanId);

/// Trace flags as carried in the last `traceparent` field.
///
/// Bit 0 is the probabilistic sampling decision, bit 1 marks a forced
/// (override) decision. Other bits are ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceFlags(u8);

impl TraceFlags {
    pub const NONE: TraceFlags = TraceFlags(0x00);
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);
    pub const FORCED: TraceFlags = TraceFlags(0x02);

    const KNOWN_BITS: u8 = 0x03;

    /// Build from raw bits, discarding unknown ones
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::KNOWN_BITS)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_sampled(self) -> bool {
        self.0 & Self::SAMPLED.0 != 0
    }

    pub const fn is_forced(self) -> bool {
        self.0 & Self::FORCED.0 != 0
    }

    pub const fn with_sampled(self, sampled: bool) -> Self {
        if sampled {
            Self(self.0 | Self::SAMPLED.0)
        } else {
            Self(self.0 & !Self::SAMPLED.0)
        }
    }

    pub const fn with_forced(self, forced: bool) -> Self {
        if forced {
            Self(self.0 | Self::FORCED.0)
        } else {
            Self(self.0 & !Self::FORCED.0)
        }
    }

    /// Whether records carrying these flags leave the process
    pub const fn should_export(self) -> bool {
        self.is_sampled() || self.is_forced()
    }
}

impl fmt::Debug for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceFlags")
            .field("sampled", &self.is_sampled())
            .field("forced", &self.is_forced())
            .finish()
    }
}

impl fmt::LowerHex for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Trace id, span id and flags of the current span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanIdentity {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub flags: TraceFlags,
}

impl SpanIdentity {
    /// Returns `None` unless both ids are valid
    pub fn new(trace_id: TraceId, span_id: SpanId, flags: TraceFlags) -> Option<Self> {
        if trace_id.is_valid() && span_id.is_valid() {
            Some(Self {
                trace_id,
                span_id,
                flags,
            })
        } else {
            None
        }
    }
}

/// Domain identifiers carried alongside the span identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Logical "as of" timestamp, opaque to the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic: Option<String>,
}

impl DomainContext {
    pub fn is_empty(&self) -> bool {
        self.fields().next().is_none()
    }

    /// Present fields as `(name, value)` pairs, in a fixed order
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("run_id", &self.run_id),
            ("as_of", &self.as_of),
            ("universe_id", &self.universe_id),
            ("message_id", &self.message_id),
            ("client_order_id", &self.client_order_id),
            ("symbol", &self.symbol),
            ("mic", &self.mic),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
    }
}

/// Identity bundle for one hop of a causal chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    #[serde(default, flatten, skip_serializing_if = "Option::is_none")]
    identity: Option<SpanIdentity>,
    #[serde(default, flatten)]
    pub domain: DomainContext,
}

impl CorrelationContext {
    /// An empty root context
    pub fn new() -> Self {
        Self::default()
    }

    /// A context with a span identity. Invalid ids yield a root context.
    pub fn with_identity(trace_id: TraceId, span_id: SpanId, flags: TraceFlags) -> Self {
        Self {
            identity: SpanIdentity::new(trace_id, span_id, flags),
            domain: DomainContext::default(),
        }
    }

    pub fn from_identity(identity: SpanIdentity) -> Self {
        Self {
            identity: Some(identity),
            domain: DomainContext::default(),
        }
    }

    pub fn identity(&self) -> Option<&SpanIdentity> {
        self.identity.as_ref()
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.identity.map(|i| i.trace_id)
    }

    pub fn span_id(&self) -> Option<SpanId> {
        self.identity.map(|i| i.span_id)
    }

    pub fn flags(&self) -> Option<TraceFlags> {
        self.identity.map(|i| i.flags)
    }

    /// True when no span identity has been generated yet
    pub fn is_root(&self) -> bool {
        self.identity.is_none()
    }

    /// True when neither an identity nor any domain field is present
    pub fn is_empty(&self) -> bool {
        self.identity.is_none() && self.domain.is_empty()
    }

    pub fn is_sampled(&self) -> bool {
        self.flags().is_some_and(TraceFlags::is_sampled)
    }

    /// Same domain fields, new identity
    pub fn with_span(&self, identity: SpanIdentity) -> Self {
        Self {
            identity: Some(identity),
            domain: self.domain.clone(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.domain.run_id = Some(run_id.into());
        self
    }

    pub fn with_as_of(mut self, as_of: impl Into<String>) -> Self {
        self.domain.as_of = Some(as_of.into());
        self
    }

    pub fn with_universe_id(mut self, universe_id: impl Into<String>) -> Self {
        self.domain.universe_id = Some(universe_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.domain.message_id = Some(message_id.into());
        self
    }

    pub fn with_client_order_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.domain.client_order_id = Some(client_order_id.into());
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.domain.symbol = Some(symbol.into());
        self
    }

    pub fn with_mic(mut self, mic: impl Into<String>) -> Self {
        self.domain.mic = Some(mic.into());
        self
    }
}

/// Source of new trace and span ids
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// A new, valid trace id
    fn new_trace_id(&self) -> TraceId;

    /// A new, valid span id
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`] backed by the thread-local CSPRNG
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        let mut rng = rand::rng();
        loop {
            let id = TraceId::from_u128(rng.random::<u128>());
            if id.is_valid() {
                return id;
            }
        }
    }

    fn new_span_id(&self) -> SpanId {
        let mut rng = rand::rng();
        loop {
            let id = SpanId::from_u64(rng.random::<u64>());
            if id.is_valid() {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_display_is_fixed_width() {
        let trace_id = TraceId::from_u128(0x1);
        let span_id = SpanId::from_u64(0xab);
        assert_eq!(trace_id.to_string(), "00000000000000000000000000000001");
        assert_eq!(span_id.to_string(), "00000000000000ab");
    }

    #[test]
    fn test_from_hex_rejects_uppercase_and_wrong_length() {
        assert!(TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").is_some());
        assert!(TraceId::from_hex("4BF92F3577B34DA6A3CE929D0E0E4736").is_none());
        assert!(TraceId::from_hex("4bf92f3577b34da6").is_none());
        assert!(SpanId::from_hex("00f067aa0ba902b7").is_some());
        assert!(SpanId::from_hex("00f067aa0ba902bz").is_none());
    }

    #[test]
    fn test_identity_requires_both_ids() {
        let trace_id = TraceId::from_u128(7);
        let span_id = SpanId::from_u64(9);
        assert!(SpanIdentity::new(trace_id, SpanId::INVALID, TraceFlags::NONE).is_none());
        assert!(SpanIdentity::new(TraceId::INVALID, span_id, TraceFlags::NONE).is_none());

        let cx = CorrelationContext::with_identity(TraceId::INVALID, span_id, TraceFlags::SAMPLED);
        assert!(cx.is_root());
    }

    #[test]
    fn test_flags_bits() {
        let flags = TraceFlags::from_bits(0xff);
        assert_eq!(flags.bits(), 0x03);
        assert!(flags.is_sampled() && flags.is_forced());

        let forced_only = TraceFlags::NONE.with_forced(true);
        assert!(!forced_only.is_sampled());
        assert!(forced_only.should_export());
        assert!(!TraceFlags::NONE.should_export());
    }

    #[test]
    fn test_random_ids_are_valid_and_distinct() {
        let ids = RandomIdGenerator::default();
        let a = ids.new_trace_id();
        let b = ids.new_trace_id();
        assert!(a.is_valid() && b.is_valid());
        assert_ne!(a, b);
        assert!(ids.new_span_id().is_valid());
    }

    #[test]
    fn test_domain_fields_in_order() {
        let cx = CorrelationContext::new()
            .with_symbol("AAPL")
            .with_run_id("run_1");
        let fields: Vec<_> = cx.domain.fields().collect();
        assert_eq!(fields, vec![("run_id", "run_1"), ("symbol", "AAPL")]);
        assert!(!cx.is_empty());
        assert!(cx.is_root());
    }

    #[test]
    fn test_serialize_context() {
        let cx = CorrelationContext::with_identity(
            TraceId::from_u128(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
            SpanId::from_u64(0x00f0_67aa_0ba9_02b7),
            TraceFlags::SAMPLED,
        )
        .with_run_id("run_7");
        let json = serde_json::to_value(&cx).unwrap();
        assert_eq!(json["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(json["span_id"], "00f067aa0ba902b7");
        assert_eq!(json["flags"], 1);
        assert_eq!(json["run_id"], "run_7");

        let back: CorrelationContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, cx);
    }
}
