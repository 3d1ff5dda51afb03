//! Access to the request bound to the current call.
//!
//! - `request_get_field(field_type, key_ptr, key_len, ident)`
//! - `request_set_field(field_type, key_ptr, key_len, val_ptr, val_len, ident)`
//! - `resp_set_header(key_ptr, key_len, val_ptr, val_len, ident)`

use futures::future::BoxFuture;

use fabric_common::{CoordinatedRequest, HostCallError};
use fabric_core::{HostCall, HostRegistry, Returns, complete, reject};

/// Which part of the request a field access addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FieldType {
    /// `method`, `url`, `id`, or the whole envelope as JSON for `""`.
    Meta = 0,
    /// The raw body for `""`, otherwise a top-level JSON body field.
    Body = 1,
    /// A request header (case-insensitive).
    Header = 2,
    /// A URL path parameter.
    Param = 3,
    /// A state entry.
    State = 4,
    /// A query-string parameter. Read-only.
    Query = 5,
}

impl FieldType {
    /// Decode the guest-side `field_type` argument.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Meta),
            1 => Some(Self::Body),
            2 => Some(Self::Header),
            3 => Some(Self::Param),
            4 => Some(Self::State),
            5 => Some(Self::Query),
            _ => None,
        }
    }
}

/// Register the request host functions.
pub fn register(registry: &mut HostRegistry) {
    registry.register("request_get_field", 4, Returns::Value, request_get_field);
    registry.register("request_set_field", 6, Returns::Value, request_set_field);
    registry.register("resp_set_header", 5, Returns::Void, resp_set_header);
}

/// Read one field of `request`.
pub fn get_field(
    request: &CoordinatedRequest,
    field: FieldType,
    key: &str,
) -> Result<Vec<u8>, HostCallError> {
    let missing = || HostCallError::Capability(format!("{field:?} field '{key}' not found"));
    match field {
        FieldType::Meta => match key {
            "method" => Ok(request.method.clone().into_bytes()),
            "url" => Ok(request.url.clone().into_bytes()),
            "id" => Ok(request.id.clone().into_bytes()),
            "body" => Ok(request.body.clone()),
            "sequence" => request
                .sequence_json
                .clone()
                .map(String::into_bytes)
                .ok_or_else(missing),
            "" => serde_json::to_vec(request)
                .map_err(|e| HostCallError::Capability(format!("failed to encode request: {e}"))),
            _ => Err(missing()),
        },
        FieldType::Body if key.is_empty() => Ok(request.body.clone()),
        FieldType::Body => request.body_field(key).ok_or_else(missing),
        FieldType::Header => request
            .header(key)
            .map(|v| v.as_bytes().to_vec())
            .ok_or_else(missing),
        FieldType::Param => request
            .params
            .get(key)
            .map(|v| v.as_bytes().to_vec())
            .ok_or_else(missing),
        FieldType::State => request.state.get(key).cloned().ok_or_else(missing),
        FieldType::Query => request
            .query_param(key)
            .map(String::into_bytes)
            .ok_or_else(missing),
    }
}

/// Set one field of `request`.
pub fn set_field(
    request: &mut CoordinatedRequest,
    field: FieldType,
    key: &str,
    value: &[u8],
) -> Result<(), HostCallError> {
    let text = || {
        String::from_utf8(value.to_vec())
            .map_err(|_| HostCallError::invalid_argument(format!("value for '{key}' is not UTF-8")))
    };
    match field {
        FieldType::Meta => match key {
            "method" => request.method = text()?,
            "url" => request.url = text()?,
            "body" => request.body = value.to_vec(),
            _ => {
                return Err(HostCallError::invalid_argument(format!(
                    "meta field '{key}' is not writable"
                )));
            }
        },
        FieldType::Body if key.is_empty() => request.body = value.to_vec(),
        FieldType::Body => {
            if !request.set_body_field(key, value) {
                return Err(HostCallError::invalid_argument("body is not a JSON object"));
            }
        }
        FieldType::Header => request.set_header(key, text()?),
        FieldType::Param => {
            request.params.insert(key.to_string(), text()?);
        }
        FieldType::State => {
            request.state.insert(key.to_string(), value.to_vec());
        }
        FieldType::Query => {
            return Err(HostCallError::invalid_argument("query fields are read-only"));
        }
    }
    Ok(())
}

fn request_get_field(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("request_get_field", ident, &e),
        };
        let (field, key_ptr, key_len) = (call.arg(0), call.arg(1), call.arg(2));

        let result = match (FieldType::from_i32(field), call.read_string(key_ptr, key_len)) {
            (None, _) => Err(HostCallError::invalid_argument(format!(
                "unknown field type {field}"
            ))),
            (_, Err(e)) => Err(e),
            (Some(field), Ok(key)) => get_field(ctx.lock().request(), field, &key),
        };
        complete(&ctx, result)
    })
}

fn request_set_field(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("request_set_field", ident, &e),
        };
        let (field, key_ptr, key_len, val_ptr, val_len) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3), call.arg(4));

        let Some(field) = FieldType::from_i32(field) else {
            let err = HostCallError::invalid_argument(format!("unknown field type {field}"));
            return complete(&ctx, Err(err));
        };
        let key = match call.read_string(key_ptr, key_len) {
            Ok(key) => key,
            Err(e) => return complete(&ctx, Err(e)),
        };
        let value = match call.read_memory(val_ptr, val_len) {
            Ok(value) => value,
            Err(e) => return complete(&ctx, Err(e)),
        };

        let result = set_field(ctx.lock().request_mut(), field, &key, &value);
        match result {
            Ok(()) => 0,
            Err(e) => complete(&ctx, Err(e)),
        }
    })
}

fn resp_set_header(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("resp_set_header", ident, &e),
        };
        let (key_ptr, key_len, val_ptr, val_len) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3));

        let header = call
            .read_string(key_ptr, key_len)
            .and_then(|key| Ok((key, call.read_string(val_ptr, val_len)?)));
        match header {
            Ok((key, value)) => {
                ctx.lock().request_mut().resp_headers.append(key, value);
                0
            }
            Err(e) => reject("resp_set_header", ident, &e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CoordinatedRequest {
        let mut req = CoordinatedRequest::new(
            "POST",
            "/name/t1/default/echo?lang=en&x=1",
            br#"{"name":"Ada","age":36}"#.to_vec(),
        );
        req.set_header("Content-Type", "application/json");
        req.params.insert("name".into(), "echo".into());
        req.state.insert("greeting".into(), b"hi".to_vec());
        req
    }

    #[test]
    fn test_field_type_is_frozen() {
        assert_eq!(FieldType::from_i32(0), Some(FieldType::Meta));
        assert_eq!(FieldType::from_i32(1), Some(FieldType::Body));
        assert_eq!(FieldType::from_i32(2), Some(FieldType::Header));
        assert_eq!(FieldType::from_i32(3), Some(FieldType::Param));
        assert_eq!(FieldType::from_i32(4), Some(FieldType::State));
        assert_eq!(FieldType::from_i32(5), Some(FieldType::Query));
        assert_eq!(FieldType::from_i32(6), None);
        assert_eq!(FieldType::State as i32, 4);
    }

    #[test]
    fn test_get_fields() {
        let req = request();
        assert_eq!(get_field(&req, FieldType::Meta, "method").unwrap(), b"POST");
        assert_eq!(get_field(&req, FieldType::Body, "name").unwrap(), b"Ada");
        assert_eq!(get_field(&req, FieldType::Body, "age").unwrap(), b"36");
        assert_eq!(
            get_field(&req, FieldType::Header, "content-type").unwrap(),
            b"application/json"
        );
        assert_eq!(get_field(&req, FieldType::Param, "name").unwrap(), b"echo");
        assert_eq!(get_field(&req, FieldType::State, "greeting").unwrap(), b"hi");
        assert_eq!(get_field(&req, FieldType::Query, "lang").unwrap(), b"en");
    }

    #[test]
    fn test_meta_envelope_is_json() {
        let req = request();
        let json = get_field(&req, FieldType::Meta, "").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["id"], req.id.as_str());
    }

    #[test]
    fn test_missing_field_is_error() {
        let req = request();
        let err = get_field(&req, FieldType::Header, "x-missing").unwrap_err();
        assert!(err.to_string().contains("x-missing"));
        assert!(get_field(&req, FieldType::Meta, "nope").is_err());
        assert!(get_field(&req, FieldType::Meta, "sequence").is_err());
    }

    #[test]
    fn test_sequence_meta_field() {
        let mut req = request();
        req.sequence_json = Some(r#"[{"fqmn":"tail"}]"#.into());
        assert_eq!(
            get_field(&req, FieldType::Meta, "sequence").unwrap(),
            br#"[{"fqmn":"tail"}]"#
        );
    }

    #[test]
    fn test_set_fields() {
        let mut req = request();
        set_field(&mut req, FieldType::Header, "X-Trace", b"abc").unwrap();
        set_field(&mut req, FieldType::State, "k", b"\x00\x01").unwrap();
        set_field(&mut req, FieldType::Body, "name", b"\"Grace\"").unwrap();
        set_field(&mut req, FieldType::Meta, "method", b"PUT").unwrap();

        assert_eq!(req.header("x-trace"), Some("abc"));
        assert_eq!(req.state["k"], b"\x00\x01");
        assert_eq!(req.body_field("name").unwrap(), b"Grace");
        assert_eq!(req.method, "PUT");
    }

    #[test]
    fn test_read_only_fields() {
        let mut req = request();
        assert!(set_field(&mut req, FieldType::Query, "lang", b"fr").is_err());
        assert!(set_field(&mut req, FieldType::Meta, "id", b"x").is_err());
        assert!(set_field(&mut req, FieldType::Header, "bad", b"\xff").is_err());
    }
}
