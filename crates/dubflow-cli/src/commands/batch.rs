//! Batch commands.

use anyhow::Result;
use serde_json::json;

use super::print_response;

pub async fn start(api_url: &str, task_id: &str, languages: Vec<String>) -> Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/batch/start/{task_id}"))
        .json(&json!({ "languages": languages }))
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}

pub async fn stop(api_url: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/batch/stop"))
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}

pub async fn status(api_url: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{api_url}/api/batch/status"))
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}

pub async fn running(api_url: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{api_url}/api/global-running-task"))
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}
