//! End-to-end query pipeline tests over the in-memory corpus

mod common;

use common::{CountingKeywords, FailingSource, Scripted};
use smartchat::cache::InvalidationListener;
use smartchat::error::{ErrorKind, SmartChatError};
use smartchat::llm::{LlmProvider, ProviderError, StreamEvent};
use smartchat::pipeline::{QueryRequest, SearchRequest, NO_RESULTS_ANSWER};
use smartchat::retrieval::FusionMethod;
use smartchat::server::ServerState;
use smartchat::types::{MutationKind, QueryFlag, Scope};
use std::sync::Arc;
use tokio::sync::mpsc;

const QUESTION: &str = "What is the refund policy?";

fn refund_question() -> QueryRequest {
    QueryRequest::new(QUESTION).with_scope(Scope::Document(42))
}

async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_falls_back_to_next_provider() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let alpha = Scripted::failing(
        "alpha",
        ProviderError::Http {
            status: 503,
            message: "overloaded".to_string(),
        },
    );
    let beta = Scripted::answering("beta", &["A full refund is available within 30 days [1]."]);
    let providers: Vec<Arc<dyn LlmProvider>> = vec![alpha.clone(), beta.clone()];
    let pipeline = common::pipeline(&common::config(), corpus, keywords.clone(), providers);

    let result = pipeline.query(&refund_question()).await.unwrap();

    assert_eq!(result.provider_used, "beta");
    assert_eq!(alpha.calls(), 1);
    assert_eq!(beta.calls(), 1);
    assert_eq!(keywords.searches(), 1);
    assert!(result.answer_text.contains("30 days"));
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].label, "[1]");
    assert_eq!(result.citations[0].document_id, 42);
}

#[tokio::test]
async fn test_all_providers_failed_lists_every_reason() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let providers: Vec<Arc<dyn LlmProvider>> = vec![
        Scripted::failing("alpha", ProviderError::Auth("bad key".to_string())),
        Scripted::failing("beta", ProviderError::Transport("connection reset".to_string())),
    ];
    let pipeline = common::pipeline(&common::config(), corpus, keywords, providers);

    let err = pipeline.query(&refund_question()).await.unwrap_err();

    match err {
        SmartChatError::AllProvidersFailed {
            correlation_id,
            reasons,
        } => {
            assert!(!correlation_id.is_empty());
            assert_eq!(reasons.len(), 2);
            assert!(reasons[0].starts_with("alpha"));
            assert!(reasons[0].contains("bad key"));
            assert!(reasons[1].starts_with("beta"));
            assert!(reasons[1].contains("connection reset"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_streamed_answer_event_order() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let providers: Vec<Arc<dyn LlmProvider>> = vec![Scripted::answering(
        "alpha",
        &["Refunds are ", "issued within ", "30 days [1]."],
    )];
    let pipeline = common::pipeline(&common::config(), corpus, keywords, providers);

    let mut rx = pipeline.query_stream(refund_question());
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let tag = |e: &StreamEvent| match e {
        StreamEvent::Search { .. } => "search",
        StreamEvent::Citations { .. } => "citations",
        StreamEvent::Chunk { .. } => "chunk",
        StreamEvent::Final(_) => "final",
        StreamEvent::Error { .. } => "error",
    };
    let tags: Vec<&str> = events.iter().map(tag).collect();
    assert_eq!(tags.first(), Some(&"search"));
    assert_eq!(tags.get(1), Some(&"citations"));
    assert_eq!(tags.last(), Some(&"final"));
    assert_eq!(tags.iter().filter(|t| **t == "search").count(), 1);
    assert_eq!(tags.iter().filter(|t| **t == "citations").count(), 1);
    assert_eq!(tags.iter().filter(|t| **t == "final").count(), 1);
    assert!(tags[2..tags.len() - 1].iter().all(|t| *t == "chunk"));

    match &events[0] {
        StreamEvent::Search {
            fragments_found, ..
        } => {
            assert!(*fragments_found >= 1);
            assert!(*fragments_found <= 30);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match &events[1] {
        StreamEvent::Citations { citations } => {
            assert!(!citations.is_empty());
            assert!(citations.iter().all(|c| c.document_id == 42));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    match events.last() {
        Some(StreamEvent::Final(result)) => {
            assert_eq!(result.answer_text, streamed);
            assert!(result.fragments_used >= 1);
            assert!(result.fragments_used <= 10);
            assert_eq!(result.provider_used, "alpha");
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
}

#[tokio::test]
async fn test_repeated_query_served_from_cache() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let alpha = Scripted::answering("alpha", &["Within 30 days [1]."]);
    let providers: Vec<Arc<dyn LlmProvider>> = vec![alpha.clone()];
    let pipeline = common::pipeline(&common::config(), corpus, keywords.clone(), providers);

    let first = pipeline.query(&refund_question()).await.unwrap();
    let second = pipeline.query(&refund_question()).await.unwrap();

    assert!(!first.has_flag(QueryFlag::ServedFromCache));
    assert!(second.has_flag(QueryFlag::ServedFromCache));
    assert_eq!(second.answer_text, first.answer_text);
    assert_eq!(second.citations, first.citations);
    assert_ne!(second.correlation_id, first.correlation_id);
    assert_eq!(alpha.calls(), 1);
    assert_eq!(keywords.searches(), 1);

    let stats = pipeline.cache().stats().await;
    assert!(stats.hits >= 1);
    assert_eq!(stats.keys.response, 1);
}

#[tokio::test]
async fn test_deleted_document_is_never_served_from_cache() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let alpha = Scripted::answering("alpha", &["Within 30 days [1]."]);
    let providers: Vec<Arc<dyn LlmProvider>> = vec![alpha.clone()];
    let pipeline = common::pipeline(&common::config(), corpus.clone(), keywords, providers);

    pipeline.query(&refund_question()).await.unwrap();
    assert_eq!(pipeline.cache().stats().await.keys.response, 1);

    let listener = InvalidationListener::spawn(pipeline.cache().clone(), 8);
    let state = ServerState::new(
        pipeline.clone(),
        corpus.clone(),
        Arc::new(common::BagOfWords),
        listener.handle(),
    );
    let report = state
        .apply_mutation(42, MutationKind::Deleted, Vec::new())
        .await
        .unwrap();

    assert_eq!(report.document_id, 42);
    assert_eq!(report.response_keys_deleted, 1);
    assert!(report.retrieval_keys_deleted >= 1);
    assert!(report.errors.is_empty());

    let after = pipeline.query(&refund_question()).await.unwrap();
    assert!(!after.has_flag(QueryFlag::ServedFromCache));
    assert_eq!(after.answer_text, NO_RESULTS_ANSWER);
    assert!(after.citations.is_empty());
    assert_eq!(alpha.calls(), 1);

    drop(state);
    listener.shutdown().await;
}

#[tokio::test]
async fn test_corpus_scope_excludes_nothing() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let providers: Vec<Arc<dyn LlmProvider>> =
        vec![Scripted::answering("alpha", &["Five business days [1]."])];
    let pipeline = common::pipeline(&common::config(), corpus, keywords, providers);

    let result = pipeline
        .query(&QueryRequest::new("How long does standard shipping take?"))
        .await
        .unwrap();

    assert!(result.fragments_found >= 1);
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].document_id, 7);
}

#[tokio::test]
async fn test_streamed_all_providers_failed_ends_in_one_error() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let providers: Vec<Arc<dyn LlmProvider>> = vec![
        Scripted::failing("alpha", ProviderError::Auth("bad key".to_string())),
        Scripted::failing("beta", ProviderError::Transport("connection reset".to_string())),
    ];
    let pipeline = common::pipeline(&common::config(), corpus, keywords, providers);

    let events = collect(pipeline.query_stream(refund_question())).await;

    let errors: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Final(_))));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Chunk { .. })));

    match events.last() {
        Some(StreamEvent::Error {
            kind,
            correlation_id,
            reasons,
            ..
        }) => {
            assert_eq!(*kind, ErrorKind::AllProvidersFailed);
            assert!(!correlation_id.is_empty());
            assert_eq!(reasons.len(), 2);
            assert!(reasons[0].starts_with("alpha"));
            assert!(reasons[0].contains("bad key"));
            assert!(reasons[1].starts_with("beta"));
            assert!(reasons[1].contains("connection reset"));
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
}

#[tokio::test]
async fn test_both_retrieval_sources_down() {
    let corpus = common::corpus().await;
    let alpha = Scripted::answering("alpha", &["Within 30 days [1]."]);
    let providers: Vec<Arc<dyn LlmProvider>> = vec![alpha.clone()];
    let pipeline = common::pipeline_over(
        &common::config(),
        corpus,
        FailingSource::new("vector index offline"),
        FailingSource::new("keyword index offline"),
        providers,
    );

    match pipeline.query(&refund_question()).await.unwrap_err() {
        SmartChatError::RetrievalUnavailable {
            correlation_id,
            reasons,
        } => {
            assert!(!correlation_id.is_empty());
            assert_eq!(reasons.len(), 2);
            assert!(reasons[0].contains("vector index offline"));
            assert!(reasons[1].contains("keyword index offline"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let events = collect(pipeline.query_stream(refund_question())).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error {
            kind,
            correlation_id,
            reasons,
            ..
        } => {
            assert_eq!(*kind, ErrorKind::RetrievalUnavailable);
            assert!(!correlation_id.is_empty());
            assert_eq!(reasons.len(), 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(alpha.calls(), 0);
    assert_eq!(pipeline.cache().stats().await.keys.retrieval, 0);
}

#[tokio::test]
async fn test_search_reports_scores_and_fusion() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let alpha = Scripted::answering("alpha", &["unused"]);
    let providers: Vec<Arc<dyn LlmProvider>> = vec![alpha.clone()];
    let pipeline = common::pipeline(&common::config(), corpus, keywords.clone(), providers);

    let response = pipeline
        .search(&SearchRequest::new("refund receipt").with_limit(2))
        .await
        .unwrap();

    assert!(!response.correlation_id.is_empty());
    assert!(!response.results.is_empty());
    assert!(response.results.len() <= 2);
    assert_eq!(response.results[0].document_id, 42);
    assert!(response.results[0].text.to_lowercase().contains("refund"));
    assert!(response.results[0].keyword_score > 0.0);
    assert!(response
        .results
        .windows(2)
        .all(|w| w[0].hybrid_score >= w[1].hybrid_score));
    assert_eq!(response.fusion.method, FusionMethod::Weighted);
    assert!((response.fusion.alpha - 0.7).abs() < 1e-6);
    assert!(response.flags.is_empty());
    assert_eq!(alpha.calls(), 0);

    // Second search is answered from the retrieval cache
    pipeline
        .search(&SearchRequest::new("refund receipt").with_limit(2))
        .await
        .unwrap();
    assert_eq!(keywords.searches(), 1);
}

#[tokio::test]
async fn test_search_flags_single_source() {
    let corpus = common::corpus().await;
    let keywords = CountingKeywords::new(corpus.clone());
    let pipeline = common::pipeline_over(
        &common::config(),
        corpus,
        FailingSource::new("vector index offline"),
        keywords,
        vec![Scripted::answering("alpha", &["unused"])],
    );

    let response = pipeline
        .search(&SearchRequest::new("shipping").with_scope(Scope::Document(7)))
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|hit| hit.document_id == 7));
    assert!(response.results.iter().all(|hit| hit.vector_score == 0.0));
    assert_eq!(response.flags, vec![QueryFlag::KeywordOnly]);
    assert_eq!(response.fusion.alpha, 0.0);
    assert!(response
        .degraded_reason
        .unwrap()
        .contains("vector index offline"));

    let err = pipeline
        .search(&SearchRequest::new("shipping").with_limit(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SmartChatError::InvalidQuery(_)));
}
