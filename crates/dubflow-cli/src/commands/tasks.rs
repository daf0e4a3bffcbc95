//! Task commands.

use anyhow::{Context, Result, bail};
use std::path::Path;

use super::print_response;

pub async fn list(api_url: &str, offset: i64, limit: i64) -> Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{api_url}/api/tasks/"))
        .query(&[("offset", offset), ("limit", limit)])
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}

pub async fn show(api_url: &str, task_id: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{api_url}/api/tasks/{task_id}"))
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}

pub async fn upload(api_url: &str, video: &Path, subtitle: Option<&Path>) -> Result<()> {
    let file_name = |path: &Path| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string())
    };

    let video_bytes = tokio::fs::read(video)
        .await
        .with_context(|| format!("reading {}", video.display()))?;
    let mut form = reqwest::multipart::Form::new().part(
        "video",
        reqwest::multipart::Part::bytes(video_bytes).file_name(file_name(video)),
    );
    if let Some(subtitle) = subtitle {
        let subtitle_bytes = tokio::fs::read(subtitle)
            .await
            .with_context(|| format!("reading {}", subtitle.display()))?;
        form = form.part(
            "subtitle",
            reqwest::multipart::Part::bytes(subtitle_bytes).file_name(file_name(subtitle)),
        );
    }

    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/tasks/"))
        .multipart(form)
        .send()
        .await?;
    print_response(response).await?;
    Ok(())
}

pub async fn delete(api_url: &str, task_id: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .delete(format!("{api_url}/api/tasks/{task_id}"))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("API error ({})", response.status());
    }
    println!("deleted {task_id}");
    Ok(())
}

pub async fn logs(
    api_url: &str,
    task_id: &str,
    language: Option<String>,
    stage: Option<String>,
) -> Result<()> {
    let mut request = reqwest::Client::new().get(format!("{api_url}/api/tasks/{task_id}/logs"));
    if let Some(language) = language {
        request = request.query(&[("language", language)]);
    }
    if let Some(stage) = stage {
        request = request.query(&[("stage", stage)]);
    }
    print_response(request.send().await?).await?;
    Ok(())
}

pub async fn trigger(
    api_url: &str,
    task_id: &str,
    stage: &str,
    language: Option<String>,
) -> Result<()> {
    let url = match stage {
        "speaker-diarization" => format!("{api_url}/api/tasks/{task_id}/speaker-diarization"),
        "translate" | "voice-cloning" | "stitch-audio" | "export-video" => {
            let Some(language) = language else {
                bail!("stage {stage} requires --language");
            };
            format!("{api_url}/api/tasks/{task_id}/languages/{language}/{stage}")
        }
        other => bail!("unknown stage {other:?}"),
    };
    let response = reqwest::Client::new().post(url).send().await?;
    print_response(response).await?;
    Ok(())
}
