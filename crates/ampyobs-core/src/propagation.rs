//! W3C-style header propagation
//!
//! `traceparent` carries the span identity and flags, `tracestate` carries the
//! vendor fields (`run_id`, `universe_id`, `as_of`) percent-encoded. Parsing
//! never fails: malformed input yields an empty context.

use crate::context::{
    CorrelationContext, DomainContext, IdGenerator, RandomIdGenerator, SpanId, SpanIdentity,
    TraceFlags, TraceId,
};
use crate::sampler::Sampler;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const RUN_ID_HEADER: &str = "run_id";
pub const UNIVERSE_ID_HEADER: &str = "universe_id";
pub const AS_OF_HEADER: &str = "as_of";

const SUPPORTED_VERSION: &str = "00";

/// Characters escaped in tracestate values
const TRACESTATE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b';')
    .add(b'=');

/// A flat string-keyed header map
pub trait HeaderCarrier {
    /// Case-insensitive lookup
    fn get(&self, key: &str) -> Option<&str>;

    fn set(&mut self, key: &str, value: String);
}

impl HeaderCarrier for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(v) = HashMap::get(self, key) {
            return Some(v.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl HeaderCarrier for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(v) = BTreeMap::get(self, key) {
            return Some(v.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Converts correlation contexts to and from header maps
#[derive(Clone)]
pub struct Propagator {
    sampler: Sampler,
    ids: Arc<dyn IdGenerator>,
}

impl fmt::Debug for Propagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Propagator")
            .field("sampler", &self.sampler)
            .field("ids", &self.ids)
            .finish()
    }
}

impl Default for Propagator {
    fn default() -> Self {
        Self::new(Sampler::default())
    }
}

impl Propagator {
    pub fn new(sampler: Sampler) -> Self {
        Self {
            sampler,
            ids: Arc::new(RandomIdGenerator::default()),
        }
    }

    /// Replace the id source, mostly for tests
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Parse a context out of incoming headers
    pub fn extract<C: HeaderCarrier + ?Sized>(&self, headers: &C) -> CorrelationContext {
        let mut cx = match headers.get(TRACEPARENT_HEADER) {
            Some(value) => match parse_traceparent(value) {
                Some(identity) => CorrelationContext::from_identity(identity),
                None => {
                    debug!(traceparent = value, "Ignoring malformed traceparent");
                    return CorrelationContext::new();
                }
            },
            None => CorrelationContext::new(),
        };

        if let Some(state) = headers.get(TRACESTATE_HEADER) {
            parse_tracestate(state, &mut cx.domain);
        }

        let fallbacks = [
            (RUN_ID_HEADER, &mut cx.domain.run_id),
            (UNIVERSE_ID_HEADER, &mut cx.domain.universe_id),
            (AS_OF_HEADER, &mut cx.domain.as_of),
        ];
        for (header, slot) in fallbacks {
            if slot.is_none() {
                if let Some(v) = headers.get(header).filter(|v| !v.is_empty()) {
                    *slot = Some(v.to_string());
                }
            }
        }

        cx
    }

    /// Write `cx` into outgoing headers.
    ///
    /// A root context first gets a fresh identity and a root sampling
    /// decision. The context actually written is returned.
    pub fn inject<C: HeaderCarrier + ?Sized>(
        &self,
        cx: &CorrelationContext,
        headers: &mut C,
    ) -> CorrelationContext {
        let cx = if cx.is_root() {
            self.new_root(cx)
        } else {
            cx.clone()
        };

        if let Some(identity) = cx.identity() {
            headers.set(TRACEPARENT_HEADER, format_traceparent(identity));
        }
        if let Some(state) = format_tracestate(&cx.domain) {
            headers.set(TRACESTATE_HEADER, state);
        }

        cx
    }

    /// Give a root context a new identity, keeping its domain fields
    pub fn new_root(&self, cx: &CorrelationContext) -> CorrelationContext {
        let trace_id = self.ids.new_trace_id();
        let span_id = self.ids.new_span_id();
        let flags = self.sampler.decide(None, trace_id, None);
        cx.with_span(SpanIdentity {
            trace_id,
            span_id,
            flags,
        })
    }
}

/// Parse `{version}-{trace_id}-{span_id}-{flags}`
pub fn parse_traceparent(value: &str) -> Option<SpanIdentity> {
    let parts: Vec<&str> = value.trim().split('-').collect();
    if parts.len() != 4 {
        return None;
    }

    if parts[0] != SUPPORTED_VERSION {
        return None;
    }

    let trace_id = TraceId::from_hex(parts[1])?;
    let span_id = SpanId::from_hex(parts[2])?;

    let flags = parts[3];
    if flags.len() != 2 || !flags.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    let bits = u8::from_str_radix(flags, 16).ok()?;

    SpanIdentity::new(trace_id, span_id, TraceFlags::from_bits(bits))
}

pub fn format_traceparent(identity: &SpanIdentity) -> String {
    format!(
        "{}-{}-{}-{:02x}",
        SUPPORTED_VERSION, identity.trace_id, identity.span_id, identity.flags
    )
}

/// Fill recognised vendor fields from a tracestate value
fn parse_tracestate(value: &str, domain: &mut DomainContext) {
    for entry in value.split(',') {
        let Some((key, raw)) = entry.trim().split_once('=') else {
            continue;
        };
        let slot = match key.trim() {
            RUN_ID_HEADER => &mut domain.run_id,
            UNIVERSE_ID_HEADER => &mut domain.universe_id,
            AS_OF_HEADER => &mut domain.as_of,
            _ => continue,
        };
        match percent_decode_str(raw.trim()).decode_utf8() {
            Ok(decoded) if !decoded.is_empty() => *slot = Some(decoded.into_owned()),
            _ => continue,
        }
    }
}

fn format_tracestate(domain: &DomainContext) -> Option<String> {
    let entries: Vec<String> = [
        (RUN_ID_HEADER, &domain.run_id),
        (UNIVERSE_ID_HEADER, &domain.universe_id),
        (AS_OF_HEADER, &domain.as_of),
    ]
    .into_iter()
    .filter_map(|(key, value)| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| format!("{}={}", key, utf8_percent_encode(v, TRACESTATE_VALUE)))
    })
    .collect();

    if entries.is_empty() {
        None
    } else {
        Some(entries.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_valid_traceparent() {
        let propagator = Propagator::default();
        let cx = propagator.extract(&headers(&[(TRACEPARENT_HEADER, VALID)]));

        assert_eq!(
            cx.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736")
        );
        assert_eq!(cx.span_id(), SpanId::from_hex("00f067aa0ba902b7"));
        assert!(cx.is_sampled());
    }

    #[test]
    fn test_extract_malformed_yields_empty_context() {
        let propagator = Propagator::default();
        let bad = [
            "",
            "00",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00F067AA0BA902B7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4bf92f3577b34da6a3ce929d0e0e473-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b-01",
            "00-4bf92f3577b34da6a3ce929d0e0e473g-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-1",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-0x",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-AA",
        ];

        for value in bad {
            let cx = propagator.extract(&headers(&[
                (TRACEPARENT_HEADER, value),
                (TRACESTATE_HEADER, "run_id=run_1"),
            ]));
            assert!(cx.is_empty(), "expected empty context for {:?}", value);
        }
    }

    #[test]
    fn test_extract_absent_traceparent_keeps_vendor_fields() {
        let propagator = Propagator::default();
        let cx = propagator.extract(&headers(&[(
            TRACESTATE_HEADER,
            "run_id=run_42,universe_id=sp500",
        )]));

        assert!(cx.is_root());
        assert_eq!(cx.domain.run_id.as_deref(), Some("run_42"));
        assert_eq!(cx.domain.universe_id.as_deref(), Some("sp500"));
    }

    #[test]
    fn test_extract_is_case_insensitive_and_uses_plain_fallbacks() {
        let propagator = Propagator::default();
        let cx = propagator.extract(&headers(&[
            ("TraceParent", VALID),
            ("Run_ID", "run_plain"),
            ("as_of", "2024-01-02T00:00:00Z"),
        ]));

        assert!(!cx.is_root());
        assert_eq!(cx.domain.run_id.as_deref(), Some("run_plain"));
        assert_eq!(cx.domain.as_of.as_deref(), Some("2024-01-02T00:00:00Z"));
    }

    #[test]
    fn test_tracestate_wins_over_plain_header() {
        let propagator = Propagator::default();
        let cx = propagator.extract(&headers(&[
            (TRACESTATE_HEADER, "run_id=from_state"),
            (RUN_ID_HEADER, "from_plain"),
        ]));
        assert_eq!(cx.domain.run_id.as_deref(), Some("from_state"));
    }

    #[test]
    fn test_tracestate_skips_unknown_and_malformed_entries() {
        let mut domain = DomainContext::default();
        parse_tracestate("vendor=x,garbage,run_id=r%2C1,universe_id=%ff", &mut domain);
        assert_eq!(domain.run_id.as_deref(), Some("r,1"));
        assert_eq!(domain.universe_id, None);
    }

    #[test]
    fn test_inject_then_extract_roundtrips() {
        let propagator = Propagator::default();
        let cx = CorrelationContext::with_identity(
            TraceId::from_u128(0xabc),
            SpanId::from_u64(0xdef),
            TraceFlags::SAMPLED.with_forced(true),
        )
        .with_run_id("run, with = odd;chars")
        .with_universe_id("univ_1")
        .with_as_of("2024-06-01T12:30:00Z");

        let mut carrier = HashMap::<String, String>::new();
        let written = propagator.inject(&cx, &mut carrier);
        assert_eq!(written, cx);

        let back = propagator.extract(&carrier);
        assert_eq!(back.identity(), cx.identity());
        assert_eq!(back.domain.run_id, cx.domain.run_id);
        assert_eq!(back.domain.universe_id, cx.domain.universe_id);
        assert_eq!(back.domain.as_of, cx.domain.as_of);
    }

    #[test]
    fn test_inject_root_generates_identity() {
        let propagator = Propagator::new(Sampler::always_on());
        let mut carrier = HashMap::<String, String>::new();
        let written = propagator.inject(&CorrelationContext::new().with_run_id("r"), &mut carrier);

        let identity = written.identity().copied().unwrap();
        assert!(identity.trace_id.is_valid());
        assert!(identity.span_id.is_valid());
        assert!(identity.flags.is_sampled());
        assert_eq!(written.domain.run_id.as_deref(), Some("r"));
        assert_eq!(
            carrier.get(TRACEPARENT_HEADER),
            Some(&format_traceparent(&identity))
        );
        assert_eq!(carrier.get(TRACESTATE_HEADER).map(String::as_str), Some("run_id=r"));
    }

    #[test]
    fn test_inject_without_vendor_fields_skips_tracestate() {
        let propagator = Propagator::default();
        let mut carrier = HashMap::<String, String>::new();
        propagator.inject(&CorrelationContext::new(), &mut carrier);
        assert!(carrier.contains_key(TRACEPARENT_HEADER));
        assert!(!carrier.contains_key(TRACESTATE_HEADER));
    }

    #[test]
    fn test_flags_format_as_two_hex_digits() {
        let identity = SpanIdentity::new(
            TraceId::from_u128(1),
            SpanId::from_u64(1),
            TraceFlags::FORCED,
        )
        .unwrap();
        assert!(format_traceparent(&identity).ends_with("-02"));
    }
}
