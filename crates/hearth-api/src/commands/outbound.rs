use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use tracing::debug;

use hearth_types::models::{Command, CommandMethod, CommandResponse};

use crate::error::AppError;
use crate::http_client::{self, HttpClient, MAX_INTEGRATION_RESPONSE_SIZE};

const LOC: &str = "do_command_request";

/// Call a custom command's endpoint with `form` and parse what it answers.
pub async fn do_command_request(
    http: &HttpClient,
    command: &Command,
    form: &[(String, String)],
) -> Result<CommandResponse, AppError> {
    let request = match command.method {
        CommandMethod::Get => {
            let mut url = Url::parse(&command.url).map_err(|e| {
                AppError::internal(LOC, "api.command.execute_command.failed.app_error", e.to_string())
            })?;
            url.query_pairs_mut()
                .extend_pairs(form.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            http.client().get(url)
        }
        CommandMethod::Post => http.client().post(&command.url).form(form),
    };

    let resp = request
        .header(ACCEPT, "application/json")
        .header(AUTHORIZATION, format!("Token {}", command.token))
        .send()
        .await
        .map_err(|e| AppError::internal(LOC, "api.command.execute_command.failed.app_error", e.to_string()))?;

    let status = resp.status();
    let content_type = http_client::content_type(&resp);
    let body = http_client::read_limited(resp, MAX_INTEGRATION_RESPONSE_SIZE)
        .await
        .map_err(|e| AppError::internal(LOC, "api.command.execute_command.failed.app_error", e.to_string()))?;

    if status != StatusCode::OK {
        debug!("/{} answered {}", command.trigger, status);
        return Err(AppError::internal(
            LOC,
            "api.command.execute_command.failed_resp.app_error",
            String::from_utf8_lossy(&body).into_owned(),
        ));
    }

    CommandResponse::from_http_body(&content_type, &body).ok_or_else(|| {
        AppError::internal(LOC, "api.command.execute_command.failed_empty.app_error", command.trigger.clone())
    })
}
