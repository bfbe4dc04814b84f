//! `agentrail stop`: ask a running gateway to stop one session or all.

use agentrail_config::AppConfig;

pub async fn run(session: Option<String>, url: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let base = match url {
        Some(url) => url,
        None => {
            let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
            format!("http://{}:{}", config.gateway.host, config.gateway.port)
        }
    };
    let endpoint = stop_endpoint(&base, session.as_deref());

    let response = reqwest::Client::new()
        .post(&endpoint)
        .send()
        .await
        .map_err(|e| format!("Could not reach gateway at {base}: {e}"))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();

    match session {
        Some(id) if status.is_success() => println!("⛔ Session {id} stopped"),
        Some(id) => {
            let message = body["message"].as_str().unwrap_or("unknown session");
            return Err(format!("Failed to stop {id} ({status}): {message}").into());
        }
        None if status.is_success() => {
            let sessions = body["sessions"].as_array().map_or(0, Vec::len);
            let processes = body["processes_terminated"].as_u64().unwrap_or(0);
            println!("⛔ Emergency stop: {sessions} session(s), {processes} process(es) terminated");
        }
        None => return Err(format!("Emergency stop failed ({status})").into()),
    }

    Ok(())
}

/// Stop URL for one session, or the global emergency stop.
pub fn stop_endpoint(base: &str, session: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match session {
        Some(id) => format!("{base}/v1/sessions/{id}/stop"),
        None => format!("{base}/v1/emergency-stop"),
    }
}
