use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ig_app::BackendError;
use ig_app::generator::backend::{ModelBackend, SdWebUiBackend};
use ig_core::config::BackendConfig;
use ig_core::request::{Conditioning, GenerationRequest, PoseMode, RunId, SamplerSettings};

fn backend(server: &MockServer) -> SdWebUiBackend {
    SdWebUiBackend::new(&BackendConfig {
        api_url: format!("{}/", server.uri()),
        ..BackendConfig::default()
    })
    .unwrap()
}

fn request() -> GenerationRequest {
    GenerationRequest {
        run_id: RunId::new(),
        sequence: 3,
        genre: "normal".into(),
        checkpoint: "base_xl.safetensors".into(),
        prompt: "masterpiece, 1girl, sitting".into(),
        negative_prompt: "lowres".into(),
        adetailer_negative: "lowres".into(),
        sampler: SamplerSettings::default(),
        conditioning: Conditioning::default(),
        selections: vec![],
        pose_mode: PoseMode::Specification,
    }
}

#[tokio::test]
async fn test_txt2img_decodes_image_and_info() {
    let server = MockServer::start().await;
    let info = json!({ "seed": 123456, "sd_model_name": "base_xl" }).to_string();
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .and(body_partial_json(json!({
            "prompt": "masterpiece, 1girl, sitting",
            "override_settings": { "sd_model_checkpoint": "base_xl.safetensors" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "images": [STANDARD.encode(b"fake-png")],
            "info": info,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let output = backend(&server).txt2img(&request()).await.unwrap();

    assert_eq!(output.bytes, b"fake-png");
    assert_eq!(output.seed, Some(123456));
    assert_eq!(output.model_version.as_deref(), Some("base_xl"));
}

#[tokio::test]
async fn test_unavailable_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
        .mount(&server)
        .await;

    let err = backend(&server).txt2img(&request()).await.unwrap_err();

    assert_eq!(
        err,
        BackendError::Http {
            status: 503,
            body: "model loading".into()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_server_error_is_a_model_crash() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(500).set_body_string("CUDA out of memory"))
        .mount(&server)
        .await;

    let err = backend(&server).txt2img(&request()).await.unwrap_err();

    assert!(matches!(err, BackendError::ModelCrash(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_empty_image_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "images": [] })))
        .mount(&server)
        .await;

    let err = backend(&server).txt2img(&request()).await.unwrap_err();
    assert_eq!(err, BackendError::EmptyResponse);
}

#[tokio::test]
async fn test_read_and_switch_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sdapi/v1/options"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sd_model_checkpoint": "base_xl.safetensors [31e35c80fc]",
            "CLIP_stop_at_last_layers": 2
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/options"))
        .and(body_partial_json(json!({ "sd_model_checkpoint": "anime_xl.safetensors" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(null)))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server);
    assert_eq!(
        backend.current_model().await.unwrap().as_deref(),
        Some("base_xl.safetensors [31e35c80fc]")
    );
    backend.switch_model("anime_xl.safetensors").await.unwrap();
}

#[tokio::test]
async fn test_slow_backend_reports_configured_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "images": [] }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let backend = SdWebUiBackend::new(&BackendConfig {
        api_url: server.uri(),
        timeout_secs: 1,
        ..BackendConfig::default()
    })
    .unwrap();
    let err = backend.txt2img(&request()).await.unwrap_err();

    assert_eq!(err, BackendError::Timeout(1));
    assert_eq!(err.to_string(), "Backend call timed out after 1s");
    assert!(err.is_transient());
}
