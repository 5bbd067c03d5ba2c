//! The wire format seam.
//!
//! Outbound payloads pass through [`WireFormat::to_wire`] exactly once per
//! message: once for the argument vector of a call, and once per value on a
//! streamed argument channel. Inbound results and stream values pass through
//! [`WireFormat::from_wire`]. Endpoints never touch payloads outside this
//! seam.

use std::sync::Arc;

use crate::error::RpcError;
use crate::message::{RemoteError, Value};

/// Map key that marks an explicit transfer list inside a map argument.
pub const TRANSFER_LIST_KEY: &str = "$transferList";

/// Transforms payloads at the transport boundary.
pub trait WireFormat: Send + Sync + 'static {
    /// Split an outbound argument vector into the values to send inline and
    /// the values the transport should move rather than copy.
    fn to_wire(&self, args: Vec<Value>) -> (Vec<Value>, Vec<Value>);

    /// Rebuild an inbound error and/or value.
    fn from_wire(
        &self,
        error: Option<RemoteError>,
        value: Option<Value>,
    ) -> (Option<RpcError>, Option<Value>);
}

/// Passes payloads through untouched; never extracts movables.
pub struct IdentityFormat;

impl WireFormat for IdentityFormat {
    fn to_wire(&self, args: Vec<Value>) -> (Vec<Value>, Vec<Value>) {
        (args, Vec::new())
    }

    fn from_wire(
        &self,
        error: Option<RemoteError>,
        value: Option<Value>,
    ) -> (Option<RpcError>, Option<Value>) {
        (error.map(RpcError::Remote), value)
    }
}

/// Applies [`extract_transfer_list`] on the way out.
pub struct TransferExtractFormat;

impl WireFormat for TransferExtractFormat {
    fn to_wire(&self, mut args: Vec<Value>) -> (Vec<Value>, Vec<Value>) {
        let movables = extract_transfer_list(&mut args);
        (args, movables)
    }

    fn from_wire(
        &self,
        error: Option<RemoteError>,
        value: Option<Value>,
    ) -> (Option<RpcError>, Option<Value>) {
        (error.map(RpcError::Remote), value)
    }
}

/// The default format used when an endpoint is bound without one.
pub fn default_format() -> Arc<dyn WireFormat> {
    Arc::new(IdentityFormat)
}

/// Movable-resource extraction heuristic, in decision order:
///
/// 1. If the trailing argument is a list whose **first** element is movable,
///    the whole list is removed from the arguments and returned verbatim,
///    non-movable stragglers included. A trailing list whose first element is
///    not movable yields an empty result with no further scanning. The
///    first-element-only check is load-bearing; callers depend on the
///    verbatim hand-back.
/// 2. Otherwise, a map argument containing [`TRANSFER_LIST_KEY`] has that
///    entry removed and its list returned, ending the scan at the first such
///    map.
/// 3. Otherwise, every `Port` argument is cloned into the result; the
///    arguments keep their inline copies.
pub fn extract_transfer_list(args: &mut Vec<Value>) -> Vec<Value> {
    if args.is_empty() {
        return Vec::new();
    }

    if let Some(Value::List(candidate)) = args.last() {
        if !candidate.first().is_some_and(Value::is_movable) {
            return Vec::new();
        }
        if let Some(Value::List(list)) = args.pop() {
            return list;
        }
        return Vec::new();
    }

    let mut promoted = Vec::new();
    for arg in args.iter_mut() {
        match arg {
            Value::Port(_) => promoted.push(arg.clone()),
            Value::Map(map) => {
                if let Some(entry) = map.remove(TRANSFER_LIST_KEY) {
                    return match entry {
                        Value::List(items) => items,
                        other => vec![other],
                    };
                }
            }
            _ => {}
        }
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PortToken;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn port(n: u64) -> Value {
        Value::Port(PortToken(n))
    }

    #[test]
    fn trailing_list_with_movable_head_is_taken_verbatim() {
        // A non-movable straggler after a qualifying head still travels.
        let mut args = vec![
            Value::Int(1),
            Value::List(vec![port(1), Value::Str("straggler".into())]),
        ];
        let movables = extract_transfer_list(&mut args);
        assert_eq!(movables, vec![port(1), Value::Str("straggler".into())]);
        assert_eq!(args, vec![Value::Int(1)]);
    }

    #[test]
    fn trailing_list_with_plain_head_yields_nothing() {
        // The first element decides alone; a movable later in the list does
        // not rescue the candidate, and no argument scan happens either.
        let mut args = vec![port(9), Value::List(vec![Value::Int(1), port(2)])];
        let movables = extract_transfer_list(&mut args);
        assert!(movables.is_empty());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn empty_trailing_list_yields_nothing() {
        let mut args = vec![port(9), Value::List(vec![])];
        assert!(extract_transfer_list(&mut args).is_empty());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn marker_key_short_circuits_the_scan() {
        let mut map = BTreeMap::new();
        map.insert(TRANSFER_LIST_KEY.to_owned(), Value::List(vec![port(5)]));
        map.insert("payload".to_owned(), Value::Int(3));
        let mut args = vec![port(1), Value::Map(map)];

        let movables = extract_transfer_list(&mut args);
        assert_eq!(movables, vec![port(5)]);

        // The marker entry is consumed; the port before the map was never
        // promoted because the marker ends the scan.
        let Value::Map(map) = &args[1] else {
            panic!("map argument survives");
        };
        assert!(!map.contains_key(TRANSFER_LIST_KEY));
        assert!(map.contains_key("payload"));
    }

    #[test]
    fn scan_promotes_ports_and_keeps_them_inline() {
        let mut args = vec![port(1), Value::Int(2), port(3)];
        let movables = extract_transfer_list(&mut args);
        assert_eq!(movables, vec![port(1), port(3)]);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn scan_does_not_promote_bytes() {
        // Bytes are movable for the trailing-list check but are not promoted
        // by the scan; only ports are.
        let mut args = vec![Value::Bytes(Bytes::from_static(b"blob")), Value::Int(1)];
        assert!(extract_transfer_list(&mut args).is_empty());

        let mut args = vec![
            Value::Int(1),
            Value::List(vec![Value::Bytes(Bytes::from_static(b"blob"))]),
        ];
        let movables = extract_transfer_list(&mut args);
        assert_eq!(movables.len(), 1);
    }

    #[test]
    fn empty_args_yield_nothing() {
        let mut args = Vec::new();
        assert!(extract_transfer_list(&mut args).is_empty());
    }

    #[test]
    fn identity_format_is_a_passthrough() {
        let (args, movables) = IdentityFormat.to_wire(vec![port(1), Value::List(vec![port(2)])]);
        assert_eq!(args.len(), 2);
        assert!(movables.is_empty());

        let (err, value) = IdentityFormat.from_wire(None, Some(Value::Int(7)));
        assert!(err.is_none());
        assert_eq!(value, Some(Value::Int(7)));
    }

    #[test]
    fn from_wire_rebuilds_remote_errors() {
        let (err, value) =
            IdentityFormat.from_wire(Some(RemoteError::with_stack("boom", "f0")), None);
        assert!(value.is_none());
        let err = err.unwrap();
        assert_eq!(err.message(), "boom");
        assert_eq!(err.remote_stack(), Some("f0"));
    }
}
