use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the effective configuration with the API key redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.config();
    let openai = &config.providers.openai;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": config.server,
            "turn": config.turn,
            "sessions": config.sessions,
            "providers": {
                "stt": config.providers.stt,
                "llm": config.providers.llm,
                "tts": config.providers.tts,
                "openai": {
                    "api_key": openai.api_key.as_ref().map(|_| "<redacted>"),
                    "base_url": openai.base_url,
                    "stt_model": openai.stt_model,
                    "llm_model": openai.llm_model,
                    "tts_model": openai.tts_model,
                    "voice": openai.voice,
                    "system_prompt": openai.system_prompt,
                    "temperature": openai.temperature,
                    "max_tokens": openai.max_tokens,
                    "request_timeout_secs": openai.request_timeout_secs
                }
            }
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::providers::Providers;
    use crate::relay::VoiceRelay;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_redacts_api_key() {
        let mut config = AppConfig::default();
        config.providers.openai.api_key = Some("sk-very-secret".to_string());
        let providers =
            Providers::from_config(&config.providers, config.turn.audio_format()).unwrap();
        let relay = VoiceRelay::from_config(&config, providers);
        let state = web::Data::new(AppState::new(config, relay));

        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let resp = test::call_service(&app, req).await;
        let body = test::read_body(resp).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(!text.contains("sk-very-secret"));

        let json: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(json["config"]["providers"]["openai"]["api_key"], "<redacted>");
        assert_eq!(json["config"]["turn"]["silence_window_ms"], 2000);
        assert_eq!(json["config"]["providers"]["stt"], "loopback");
    }
}
