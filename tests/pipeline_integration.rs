//! End-to-end pipeline integration tests
//!
//! Corrections flow through the correction service into the queue, the
//! modeller folds them into a new model, and the prediction service picks the
//! new version up, all on filesystem-backed storage.

#[allow(dead_code)]
mod common;

use bytes::Bytes;
use common::*;
use flowerloop::config::ModellerConfig;
use flowerloop::corrections::{self, CorrectionsClient, CorrectionsState};
use flowerloop::dataset::ValidationSet;
use flowerloop::model::{artifact, FlowerClassifier, ModelRegistry};
use flowerloop::modeller::{Modeller, TickOutcome};
use flowerloop::predict::{self, PredictClient, PredictState};
use flowerloop::queue::MessageQueue;
use flowerloop::storage::BlobStore;
use flowerloop::types::{CorrectionMessage, Label, ModelVersion};
use flowerloop::FlowerError;
use std::sync::Arc;

async fn modeller_for(env: &TestEnv, registry: Arc<ModelRegistry>, gen: &mut ImageGenerator) -> Modeller {
    let val_dir = env.subdir("validation");
    gen.write_validation_dir(&val_dir, 2);
    let validation = ValidationSet::from_dir(&val_dir, registry.config().input_res)
        .await
        .expect("validation set");
    assert_eq!(validation.len(), 10);

    Modeller::new(
        env.blobs.clone(),
        env.queue.clone(),
        registry,
        ModellerConfig::default(),
        validation,
    )
}

// =============================================================================
// Full Loop
// =============================================================================

#[tokio::test]
async fn test_corrections_retrain_and_serve_new_version() {
    let env = TestEnv::new();
    let registry = env.registry();
    let mut gen = ImageGenerator::new(7);

    // 1. Seed the initial model
    assert_eq!(registry.bootstrap().await.unwrap(), Some(ModelVersion::DEFAULT));

    // 2. Start both services
    let predict_server = TestServer::start(predict::router(
        PredictState {
            registry: registry.clone(),
        },
        1024 * 1024,
    ))
    .await;
    let corrections_server = TestServer::start(corrections::router(
        CorrectionsState {
            blobs: env.blobs.clone(),
            queue: env.queue.clone(),
            predict: PredictClient::new(&format!("{}/predict", predict_server.url())),
        },
        1024 * 1024,
    ))
    .await;

    let predict_client = PredictClient::new(&predict_server.url());
    let corrections_client = CorrectionsClient::new(&corrections_server.url());
    assert_eq!(predict_client.version().await.unwrap().version, 1);

    // 3. Four corrections are not enough to retrain
    let mut modeller = modeller_for(&env, registry.clone(), &mut gen).await;
    let labels = [Label::Roses, Label::Daisy, Label::Tulips, Label::Dandelion, Label::Sunflowers];
    for label in &labels[..4] {
        let receipt = corrections_client
            .submit("flower.jpg", Bytes::from(gen.flower(*label)), *label)
            .await
            .unwrap();
        assert!(receipt.blob_name.starts_with(corrections::UPLOAD_PREFIX));
    }
    assert!(matches!(modeller.tick().await.unwrap(), TickOutcome::Idle { depth: 4 }));
    assert_eq!(env.blobs.list(corrections::UPLOAD_PREFIX).await.unwrap().len(), 4);

    // 4. The fifth tips it over
    corrections_client
        .submit("flower.jpg", Bytes::from(gen.flower(labels[4])), labels[4])
        .await
        .unwrap();

    let summary = match modeller.tick().await.unwrap() {
        TickOutcome::Published(summary) => summary,
        other => panic!("expected a publish, got {:?}", other),
    };
    assert_eq!(summary.parent, ModelVersion::DEFAULT);
    assert!(summary.version > ModelVersion::DEFAULT);
    assert_eq!(summary.samples, 5);
    assert_eq!(summary.history.epoch_losses.len(), 3);
    assert_eq!(summary.evaluation.samples, 10);

    // 5. Queue and uploads are consumed
    assert_eq!(env.queue.approximate_message_count().await.unwrap(), 0);
    assert!(env.blobs.list(corrections::UPLOAD_PREFIX).await.unwrap().is_empty());
    assert!(env.blobs.exists(&summary.blob_name).await.unwrap());

    // 6. Both the prediction service and the proxy serve the new version
    let info = predict_client.version().await.unwrap();
    assert_eq!(info.version, summary.version.as_u64());

    let direct = predict_client
        .predict("rose.jpg", "image/jpeg", Bytes::from(gen.flower(Label::Roses)))
        .await
        .unwrap();
    assert_eq!(direct.version, summary.version.as_u64());
    assert!(direct.confidence > 0.0 && direct.confidence <= 1.0);

    let proxied = PredictClient::new(&corrections_server.url())
        .predict("rose.jpg", "image/jpeg", Bytes::from(gen.flower(Label::Roses)))
        .await
        .unwrap();
    assert_eq!(proxied.version, summary.version.as_u64());

    // 7. A fresh registry over the same storage agrees on the latest version
    let restarted = env.registry();
    let (version, model) = restarted.load_latest().await.unwrap();
    assert_eq!(version, summary.version);
    assert_eq!(model.parent_version(), Some(1));
    assert_eq!(model.trained_samples(), 5);

    corrections_server.stop().await;
    predict_server.stop().await;
}

// =============================================================================
// Version Resolution
// =============================================================================

#[tokio::test]
async fn test_malformed_model_names_are_ignored() {
    let env = TestEnv::new();
    let registry = env.registry();

    for name in ["models/model_abc.bin", "models/readme.txt", "models/model_12x.bin"] {
        env.blobs.put(name, Bytes::from_static(b"junk"), true).await.unwrap();
    }
    assert_eq!(registry.list_versions().await.unwrap(), Vec::<ModelVersion>::new());
    assert_eq!(registry.latest_version().await.unwrap(), ModelVersion::DEFAULT);

    // Nothing is published under version 1, so prediction is unavailable.
    let server = TestServer::start(predict::router(
        PredictState {
            registry: registry.clone(),
        },
        1024 * 1024,
    ))
    .await;
    let client = PredictClient::new(&server.url());
    let mut gen = ImageGenerator::default();
    let err = client
        .predict("d.jpg", "image/jpeg", Bytes::from(gen.flower(Label::Daisy)))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowerError::Upstream { status: 503, .. }), "got {:?}", err);

    // A well-formed name wins over the noise.
    let model = FlowerClassifier::new(registry.classifier_spec());
    env.blobs
        .put("models/model_1700000000.bin", artifact::encode(&model).unwrap(), false)
        .await
        .unwrap();
    assert_eq!(registry.latest_version().await.unwrap(), ModelVersion::new(1_700_000_000));

    let prediction = client
        .predict("d.jpg", "image/jpeg", Bytes::from(gen.flower(Label::Daisy)))
        .await
        .unwrap();
    assert_eq!(prediction.version, 1_700_000_000);

    server.stop().await;
}

// =============================================================================
// Queue Hygiene
// =============================================================================

#[tokio::test]
async fn test_poison_messages_are_dropped_during_retrain() {
    let env = TestEnv::new();
    let registry = env.registry();
    registry.bootstrap().await.unwrap();
    let mut gen = ImageGenerator::new(11);
    let mut modeller = modeller_for(&env, registry.clone(), &mut gen).await;

    env.queue.send_message("not json").await.unwrap();
    env.queue
        .send_message(&CorrectionMessage::new("uploads/missing.jpg", Label::Roses).to_json().unwrap())
        .await
        .unwrap();
    for (i, label) in Label::ALL.iter().enumerate() {
        let name = format!("uploads/{}.jpg", i);
        env.blobs.put(&name, Bytes::from(gen.flower(*label)), false).await.unwrap();
        env.queue
            .send_message(&CorrectionMessage::new(name, *label).to_json().unwrap())
            .await
            .unwrap();
    }

    let summary = match modeller.tick().await.unwrap() {
        TickOutcome::Published(summary) => summary,
        other => panic!("expected a publish, got {:?}", other),
    };
    assert_eq!(summary.samples, 5);
    assert_eq!(summary.skipped, 2);
    assert_eq!(env.queue.approximate_message_count().await.unwrap(), 0);

    // Idle again until new corrections arrive.
    assert!(matches!(modeller.tick().await.unwrap(), TickOutcome::Idle { depth: 0 }));
}

#[tokio::test]
async fn test_rejected_uploads_leave_no_trace() {
    let env = TestEnv::new();
    let server = TestServer::start(corrections::router(
        CorrectionsState {
            blobs: env.blobs.clone(),
            queue: env.queue.clone(),
            predict: PredictClient::new(&format!("http://{}", unused_addr())),
        },
        1024 * 1024,
    ))
    .await;

    let form = reqwest::multipart::Form::new()
        .part(
            predict::IMAGE_FIELD,
            reqwest::multipart::Part::bytes(ImageGenerator::default().png([0, 0, 255]))
                .file_name("blue.png")
                .mime_str("image/png")
                .unwrap(),
        )
        .text(corrections::LABEL_FIELD, "roses");
    let response = reqwest::Client::new()
        .post(format!("{}/corrections", server.url()))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    assert!(env.blobs.list("").await.unwrap().is_empty());
    assert_eq!(env.queue.approximate_message_count().await.unwrap(), 0);

    server.stop().await;
}
