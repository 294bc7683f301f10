//! The JSON envelope every HTTP response is wrapped in.

use serde_json::{json, Value};
use warp::{http::StatusCode, reply, Reply};

pub fn success(result: Value) -> reply::Response {
	reply::with_status(
		reply::json(&json!({ "status": "OK", "result": result })),
		StatusCode::OK,
	)
	.into_response()
}

pub fn failure(errors: impl Into<Value>, status: StatusCode) -> reply::Response {
	reply::with_status(
		reply::json(&json!({ "status": "FAIL", "errors": errors.into() })),
		status,
	)
	.into_response()
}
