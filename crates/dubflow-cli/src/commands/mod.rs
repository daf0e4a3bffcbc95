//! CLI command implementations.

pub mod batch;
pub mod tasks;

use anyhow::{Result, bail};
use serde_json::Value;

/// Print a response as pretty JSON, failing on API error bodies.
pub(crate) async fn print_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        bail!(
            "API error ({status}): {}",
            serde_json::to_string_pretty(&body)?
        );
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(body)
}
