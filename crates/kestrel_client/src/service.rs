//! Wire-level service details owned by the core: operation names, method
//! codes, the auth frame, the discovery payload and the response error
//! frame.
//!
//! Every request item is an array `[method_code, ...payload]`. A response
//! begins with either a null (success; the body follows) or an error frame
//! array decoded by [`decode_error`].

use std::net::IpAddr;

use kestrel_codec::types::{ARRAY, MAJOR_TYPE_MASK, NIL};
use kestrel_codec::{CborReader, CborWriter, CodecError, CodecResult};
use kestrel_common::config::HostPort;
use kestrel_common::error::{CancellationReason, Fault, KestrelError};

// ── Operation names ──────────────────────────────────────────────────────

pub const OP_GET_ITEM: &str = "GetItem";
pub const OP_PUT_ITEM: &str = "PutItem";
pub const OP_UPDATE_ITEM: &str = "UpdateItem";
pub const OP_DELETE_ITEM: &str = "DeleteItem";
pub const OP_BATCH_GET_ITEM: &str = "BatchGetItem";
pub const OP_BATCH_WRITE_ITEM: &str = "BatchWriteItem";
pub const OP_TRANSACT_GET_ITEMS: &str = "TransactGetItems";
pub const OP_TRANSACT_WRITE_ITEMS: &str = "TransactWriteItems";
pub const OP_QUERY: &str = "Query";
pub const OP_SCAN: &str = "Scan";
pub const OP_ENDPOINTS: &str = "Endpoints";
pub const OP_DEFINE_ATTRIBUTE_LIST: &str = "DefineAttributeList";
pub const OP_DEFINE_ATTRIBUTE_LIST_ID: &str = "DefineAttributeListId";
pub const OP_DEFINE_KEY_SCHEMA: &str = "DefineKeySchema";

/// Control-plane lookups are served before normal waiters in the pool.
pub fn is_high_priority(op: &str) -> bool {
    matches!(
        op,
        OP_DEFINE_ATTRIBUTE_LIST | OP_DEFINE_ATTRIBUTE_LIST_ID | OP_DEFINE_KEY_SCHEMA
    )
}

/// Read-path operations feed the per-node health accounting.
pub fn is_read_op(op: &str) -> bool {
    matches!(op, OP_GET_ITEM | OP_BATCH_GET_ITEM | OP_QUERY | OP_SCAN)
}

// ── Method codes ─────────────────────────────────────────────────────────

pub const METHOD_AUTH: u64 = 0;
pub const METHOD_ENDPOINTS: u64 = 1;
pub const METHOD_DEFINE_KEY_SCHEMA: u64 = 2;
pub const METHOD_DEFINE_ATTRIBUTE_LIST: u64 = 3;
pub const METHOD_DEFINE_ATTRIBUTE_LIST_ID: u64 = 4;

// ── Discovery payload ────────────────────────────────────────────────────

/// One node as reported by the discovery RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub node_id: i64,
    pub hostname: String,
    pub address: Vec<u8>,
    pub port: u16,
    pub role: i32,
    pub availability_zone: String,
    pub leader_session_id: i64,
}

impl ServiceEndpoint {
    /// The canonical active-map key for this node.
    pub fn host_port(&self) -> HostPort {
        let host = match self.address.len() {
            4 => {
                let b = &self.address;
                IpAddr::from([b[0], b[1], b[2], b[3]]).to_string()
            }
            16 => {
                let mut a = [0u8; 16];
                a.copy_from_slice(&self.address);
                IpAddr::from(a).to_string()
            }
            _ => self.hostname.clone(),
        };
        HostPort::new(host, self.port)
    }
}

pub fn encode_endpoints_request(w: &mut CborWriter) {
    w.write_array_header(1);
    w.write_u64(METHOD_ENDPOINTS);
}

pub fn decode_endpoints_response(r: &mut CborReader<'_>) -> CodecResult<Vec<ServiceEndpoint>> {
    let len = r.read_array_len()?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let fields = r.read_array_len()?;
        if fields != 7 {
            return Err(CodecError::Deserialization(format!(
                "service endpoint must have 7 fields, got {fields}"
            )));
        }
        let node_id = r.read_int()?;
        let hostname = r.read_string()?;
        let address = r.read_bytes()?;
        let port = r.read_int()? as u16;
        let role = r.read_int()? as i32;
        let availability_zone = r.read_string()?;
        let leader_session_id = r.read_int()?;
        out.push(ServiceEndpoint {
            node_id,
            hostname,
            address,
            port,
            role,
            availability_zone,
            leader_session_id,
        });
    }
    Ok(out)
}

/// Encode a discovery response body. Used by in-process test servers.
pub fn encode_endpoints_response(w: &mut CborWriter, endpoints: &[ServiceEndpoint]) {
    w.write_array_header(endpoints.len());
    for ep in endpoints {
        w.write_array_header(7);
        w.write_int(ep.node_id);
        w.write_string(&ep.hostname);
        w.write_bytes(&ep.address);
        w.write_int(ep.port as i64);
        w.write_int(ep.role as i64);
        w.write_string(&ep.availability_zone);
        w.write_int(ep.leader_session_id);
    }
}

// ── Auth frame ───────────────────────────────────────────────────────────

pub fn encode_auth_frame(
    w: &mut CborWriter,
    access_key_id: &str,
    session_token: Option<&str>,
    string_to_sign: &str,
    signature: &str,
    user_agent: &str,
) {
    w.write_array_header(6);
    w.write_u64(METHOD_AUTH);
    w.write_string(access_key_id);
    match session_token {
        Some(t) => w.write_string(t),
        None => w.write_null(),
    }
    w.write_string(string_to_sign);
    w.write_string(signature);
    w.write_string(user_agent);
}

// ── Key schema and attribute lists ───────────────────────────────────────

/// One key attribute of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDefinition {
    pub name: String,
    pub attribute_type: String,
}

pub fn encode_define_key_schema_request(w: &mut CborWriter, table: &str) {
    w.write_array_header(2);
    w.write_u64(METHOD_DEFINE_KEY_SCHEMA);
    w.write_string(table);
}

pub fn decode_define_key_schema_response(
    r: &mut CborReader<'_>,
) -> CodecResult<Vec<AttributeDefinition>> {
    let len = r.read_map_len()?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let name = r.read_string()?;
        let attribute_type = r.read_string()?;
        out.push(AttributeDefinition { name, attribute_type });
    }
    Ok(out)
}

pub fn encode_define_attribute_list_id_request(w: &mut CborWriter, names: &[String]) {
    w.write_array_header(2);
    w.write_u64(METHOD_DEFINE_ATTRIBUTE_LIST_ID);
    w.write_array_header(names.len());
    for n in names {
        w.write_string(n);
    }
}

pub fn decode_define_attribute_list_id_response(r: &mut CborReader<'_>) -> CodecResult<i64> {
    r.read_int()
}

pub fn encode_define_attribute_list_request(w: &mut CborWriter, id: i64) {
    w.write_array_header(2);
    w.write_u64(METHOD_DEFINE_ATTRIBUTE_LIST);
    w.write_int(id);
}

pub fn decode_define_attribute_list_response(r: &mut CborReader<'_>) -> CodecResult<Vec<String>> {
    let len = r.read_array_len()?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(r.read_string()?);
    }
    Ok(out)
}

// ── Error frame ──────────────────────────────────────────────────────────

fn fault_from_wire(v: i64) -> Fault {
    match v {
        0 => Fault::Server,
        1 => Fault::Client,
        _ => Fault::Unknown,
    }
}

fn fault_to_wire(f: Fault) -> i64 {
    match f {
        Fault::Server => 0,
        Fault::Client => 1,
        Fault::Unknown => 2,
    }
}

/// Decode the leading error frame of a response.
///
/// Returns `Ok(None)` after consuming the success marker, leaving the
/// reader at the response body. A `Truncated` failure means the caller
/// should refill its buffer and retry from the frame start.
pub fn decode_error(r: &mut CborReader<'_>) -> CodecResult<Option<KestrelError>> {
    let hdr = r.peek_header()?;
    if hdr == NIL {
        r.read_null()?;
        return Ok(None);
    }
    if hdr & MAJOR_TYPE_MASK != ARRAY {
        return Err(CodecError::Deserialization(format!(
            "response must start with a null or an error frame, got header {hdr:#04x}"
        )));
    }

    let len = r.read_array_len()?;
    if !(6..=7).contains(&len) {
        return Err(CodecError::Deserialization(format!(
            "error frame must have 6 or 7 fields, got {len}"
        )));
    }
    let code_count = r.read_array_len()?;
    let mut code_seq = Vec::with_capacity(code_count);
    for _ in 0..code_count {
        code_seq.push(r.read_int()? as i32);
    }
    let code = r.read_string()?;
    let message = r.read_string()?;
    let request_id = if r.try_read_null()? {
        String::new()
    } else {
        r.read_string()?
    };
    let status = r.read_int()? as i32;
    let fault = fault_from_wire(r.read_int()?);

    if len == 6 {
        return Ok(Some(KestrelError::ServerRequestFailure {
            code_seq,
            code,
            message,
            request_id,
            status,
            fault,
        }));
    }

    let reason_count = r.read_array_len()?;
    let mut cancellation_reasons = Vec::with_capacity(reason_count);
    for _ in 0..reason_count {
        let fields = r.read_array_len()?;
        if fields != 3 {
            return Err(CodecError::Deserialization(format!(
                "cancellation reason must have 3 fields, got {fields}"
            )));
        }
        let code = if r.try_read_null()? { None } else { Some(r.read_string()?) };
        let message = if r.try_read_null()? { None } else { Some(r.read_string()?) };
        let item = if r.try_read_null()? {
            None
        } else {
            match kestrel_codec::decode_attribute_value(r)? {
                kestrel_codec::AttributeValue::M(m) => Some(m),
                other => {
                    return Err(CodecError::Deserialization(format!(
                        "cancellation reason item is not a map: {other:?}"
                    )))
                }
            }
        };
        cancellation_reasons.push(CancellationReason { code, message, item });
    }
    Ok(Some(KestrelError::TransactionCanceled {
        code_seq,
        code,
        message,
        request_id,
        status,
        fault,
        cancellation_reasons,
    }))
}

/// Encode a success marker. Used by in-process test servers.
pub fn encode_success_marker(w: &mut CborWriter) {
    w.write_null();
}

/// Encode an error frame. Used by in-process test servers.
pub fn encode_error_frame(
    w: &mut CborWriter,
    code_seq: &[i32],
    code: &str,
    message: &str,
    request_id: Option<&str>,
    status: i32,
    fault: Fault,
    cancellation_reasons: Option<&[CancellationReason]>,
) {
    w.write_array_header(if cancellation_reasons.is_some() { 7 } else { 6 });
    w.write_array_header(code_seq.len());
    for c in code_seq {
        w.write_int(*c as i64);
    }
    w.write_string(code);
    w.write_string(message);
    match request_id {
        Some(id) => w.write_string(id),
        None => w.write_null(),
    }
    w.write_int(status as i64);
    w.write_int(fault_to_wire(fault));
    if let Some(reasons) = cancellation_reasons {
        w.write_array_header(reasons.len());
        for reason in reasons {
            w.write_array_header(3);
            match &reason.code {
                Some(c) => w.write_string(c),
                None => w.write_null(),
            }
            match &reason.message {
                Some(m) => w.write_string(m),
                None => w.write_null(),
            }
            match &reason.item {
                Some(item) => {
                    let value = kestrel_codec::AttributeValue::M(item.clone());
                    // items come from the server, so encoding cannot hit the
                    // client-side validation failures
                    let _ = kestrel_codec::encode_attribute_value(&value, w);
                }
                None => w.write_null(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_priority_set() {
        assert!(is_high_priority(OP_DEFINE_KEY_SCHEMA));
        assert!(is_high_priority(OP_DEFINE_ATTRIBUTE_LIST));
        assert!(is_high_priority(OP_DEFINE_ATTRIBUTE_LIST_ID));
        assert!(!is_high_priority(OP_GET_ITEM));
        assert!(!is_high_priority(OP_ENDPOINTS));
    }

    #[test]
    fn test_read_op_set() {
        for op in [OP_GET_ITEM, OP_BATCH_GET_ITEM, OP_QUERY, OP_SCAN] {
            assert!(is_read_op(op));
        }
        for op in [OP_PUT_ITEM, OP_TRANSACT_WRITE_ITEMS, OP_ENDPOINTS] {
            assert!(!is_read_op(op));
        }
    }

    #[test]
    fn test_endpoints_round_trip() {
        let endpoints = vec![
            ServiceEndpoint {
                node_id: 1,
                hostname: "node-1.cluster".into(),
                address: vec![127, 0, 0, 1],
                port: 8111,
                role: 1,
                availability_zone: "us-east-1a".into(),
                leader_session_id: 7,
            },
            ServiceEndpoint {
                node_id: 2,
                hostname: "node-2.cluster".into(),
                address: vec![10, 0, 0, 2],
                port: 8111,
                role: 2,
                availability_zone: "us-east-1b".into(),
                leader_session_id: 7,
            },
        ];
        let mut w = CborWriter::new();
        encode_endpoints_response(&mut w, &endpoints);
        let mut r = CborReader::new(w.as_slice());
        assert_eq!(decode_endpoints_response(&mut r).unwrap(), endpoints);
    }

    #[test]
    fn test_host_port_from_address_bytes() {
        let ep = ServiceEndpoint {
            node_id: 1,
            hostname: "ignored".into(),
            address: vec![192, 168, 1, 20],
            port: 9111,
            role: 1,
            availability_zone: String::new(),
            leader_session_id: 0,
        };
        assert_eq!(ep.host_port(), HostPort::new("192.168.1.20", 9111));
    }

    #[test]
    fn test_decode_error_success_marker() {
        let mut w = CborWriter::new();
        encode_success_marker(&mut w);
        w.write_int(42); // body
        let mut r = CborReader::new(w.as_slice());
        assert!(decode_error(&mut r).unwrap().is_none());
        assert_eq!(r.read_int().unwrap(), 42);
    }

    #[test]
    fn test_decode_error_failure_frame() {
        let mut w = CborWriter::new();
        encode_error_frame(&mut w, &[4, 23, 24], "empty", "no such table", Some("rid-1"), 400, Fault::Client, None);
        let mut r = CborReader::new(w.as_slice());
        let err = decode_error(&mut r).unwrap().expect("expected failure frame");
        match err {
            KestrelError::ServerRequestFailure { code_seq, message, request_id, status, fault, .. } => {
                assert_eq!(code_seq, vec![4, 23, 24]);
                assert_eq!(message, "no such table");
                assert_eq!(request_id, "rid-1");
                assert_eq!(status, 400);
                assert_eq!(fault, Fault::Client);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_transaction_canceled() {
        let reasons = vec![
            CancellationReason {
                code: Some("ConditionalCheckFailed".into()),
                message: Some("condition failed".into()),
                item: None,
            },
            CancellationReason::default(),
        ];
        let mut w = CborWriter::new();
        encode_error_frame(
            &mut w,
            &[4, 37, 38, 39, 58],
            "empty",
            "canceled",
            None,
            400,
            Fault::Client,
            Some(&reasons),
        );
        let mut r = CborReader::new(w.as_slice());
        match decode_error(&mut r).unwrap().expect("expected failure") {
            KestrelError::TransactionCanceled { cancellation_reasons, request_id, .. } => {
                assert_eq!(cancellation_reasons, reasons);
                assert_eq!(request_id, "");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_truncated_is_resumable() {
        let mut w = CborWriter::new();
        encode_error_frame(&mut w, &[1], "empty", "try again", None, 500, Fault::Server, None);
        let full = w.as_slice().to_vec();
        let mut r = CborReader::new(&full[..3]);
        assert!(decode_error(&mut r).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_decode_error_rejects_other_items() {
        let mut w = CborWriter::new();
        w.write_int(5);
        let mut r = CborReader::new(w.as_slice());
        let err = decode_error(&mut r).unwrap_err();
        assert!(!err.is_incomplete());
    }
}
