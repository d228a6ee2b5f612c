//! Query routing and engine behavior through the public facade.

use std::sync::Arc;

use graph_rag::GraphRag;
use graph_rag::config::GraphRagConfig;
use graph_rag::domain::answer::{Citation, QueryMode};
use graph_rag::domain::chunk::ChunkRecord;
use graph_rag::domain::graph::{EntityRow, RelationRow, SummaryRow};
use graph_rag::ids::{node_id, relation_id};
use graph_rag::provider::mock::MockChat;
use graph_rag::query::QueryOptions;
use graph_rag::store::GraphStore;
use graph_rag::store::providers::MemoryGraphStore;

fn entity(series: &str, name: &str, conf: f32) -> EntityRow {
    EntityRow {
        id: node_id(series, name, "Org"),
        series: series.to_string(),
        name: name.to_string(),
        entity_type: "Org".to_string(),
        aliases: Vec::new(),
        desc: format!("{name} is an organization"),
        cids: vec!["c1".to_string()],
        conf,
        evec: None,
    }
}

fn relation(series: &str, src: &str, dst: &str, pred: &str, conf: f32) -> RelationRow {
    let src_id = node_id(series, src, "Org");
    let dst_id = node_id(series, dst, "Org");
    RelationRow {
        id: relation_id(series, &src_id, pred, &dst_id),
        series: series.to_string(),
        src_id,
        dst_id,
        pred: pred.to_string(),
        cids: vec!["c1".to_string()],
        conf,
    }
}

/// Store with a small graph, one chunk, and two summaries.
async fn seeded_store(series: &str) -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    store
        .upsert_chunks(&[ChunkRecord {
            id: "c1".to_string(),
            series: series.to_string(),
            doc_id: Some("report.pdf".to_string()),
            page: Some(2),
            order: Some(0),
            text: "Acme acquired Beta in 2021. The logo couleur is blue.".to_string(),
            embedding: None,
        }])
        .await
        .unwrap();
    store
        .upsert_entities(
            series,
            &[
                entity(series, "Acme", 0.9),
                entity(series, "Beta", 0.9),
                entity(series, "France", 0.8),
            ],
        )
        .await
        .unwrap();
    store
        .upsert_relations(
            series,
            &[
                relation(series, "Acme", "Beta", "ACQUIRED", 0.8),
                relation(series, "Beta", "France", "LOCATED_IN", 0.8),
            ],
        )
        .await
        .unwrap();
    store
        .replace_summaries(
            series,
            0,
            &[SummaryRow {
                id: "c0_comm17@L0".to_string(),
                series: series.to_string(),
                level: 0,
                cid: "c0_comm17".to_string(),
                text: "Acme acquired Beta in 2021. Both are organizations.".to_string(),
                tokens: 9,
                vec: None,
            }],
        )
        .await
        .unwrap();
    store
        .replace_summaries(
            series,
            1,
            &[SummaryRow {
                id: "c1_comm3@L1".to_string(),
                series: series.to_string(),
                level: 1,
                cid: "c1_comm3".to_string(),
                text: "Beta operates from France.".to_string(),
                tokens: 4,
                vec: None,
            }],
        )
        .await
        .unwrap();
    store
}

fn service(store: Arc<MemoryGraphStore>, chat: MockChat) -> GraphRag {
    // Embeddings disabled: retrieval exercises the keyword/fulltext paths.
    GraphRag::new(store, Arc::new(chat), None, GraphRagConfig::default())
}

#[tokio::test]
async fn test_routing_matrix() {
    // S3: compare -> graph, factual+digits -> path, short plain -> vector.
    let store = seeded_store("s1").await;
    let chat = MockChat::new()
        .on(
            "Community summary",
            r#"{"partial_answer": "Acme acquired Beta.", "confidence": 0.9}"#,
        )
        .on(
            "partial answers",
            r#"{"answer": "A global comparison.", "used": ["c0_comm17@L0"], "confidence": 0.8}"#,
        )
        .fallback("plain answer");
    let svc = service(store, chat);

    let graph = svc
        .query("s1", "Compare Acme and Beta impact in 2021", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(graph.mode_used, QueryMode::Graph);

    let path = svc
        .query("s1", "Qui de Acme a acquis Beta en 2021 ?", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(path.mode_used, QueryMode::Path);

    let vector = svc
        .query("s1", "logo couleur", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(vector.mode_used, QueryMode::Vector);
}

#[tokio::test]
async fn test_graph_mode_reduce_citations() {
    // S5: reduce names one used partial; the citation snippet is its first
    // sentence, capped at 280 chars.
    let store = seeded_store("s2").await;
    let chat = MockChat::new()
        .on(
            "Community summary",
            r#"{"partial_answer": "Acme acquired Beta in 2021. Extra sentence.", "confidence": 0.9}"#,
        )
        .on(
            "partial answers",
            r#"{"answer": "Acme acquired Beta.", "used": ["c0_comm17@L0"], "confidence": 0.8}"#,
        );
    let svc = service(store, chat);

    let bundle = svc
        .query(
            "s2",
            "overview of the acquisitions",
            &QueryOptions {
                mode: Some(QueryMode::Graph),
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(bundle.citations.len(), 1);
    match &bundle.citations[0] {
        Citation::Graph { id, snippet } => {
            assert_eq!(id, "c0_comm17@L0");
            assert_eq!(snippet, "Acme acquired Beta in 2021");
            assert!(snippet.chars().count() <= 280);
        }
        other => panic!("expected graph citation, got {other:?}"),
    }
    assert_eq!(
        bundle.token_usage.total,
        bundle.token_usage.prompt + bundle.token_usage.completion
    );
}

#[tokio::test]
async fn test_path_mode_scoring_and_citations() {
    // S4: a direct path and a 2-hop path exist between the seed entities;
    // citations arrive best-first with valid graph element ids.
    let store = seeded_store("s3").await;
    let chat = MockChat::new().fallback("Acme acquired Beta, which is located in France.");
    let svc = service(Arc::clone(&store), chat);

    let bundle = svc
        .query(
            "s3",
            "relation entre Acme Beta France",
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bundle.mode_used, QueryMode::Path);
    assert!(!bundle.citations.is_empty());

    let (entities, relations) = store.load_graph("s3").await.unwrap();
    let entity_ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    let relation_ids: Vec<&str> = relations.iter().map(|r| r.id.as_str()).collect();

    let mut last_score = f32::INFINITY;
    for citation in &bundle.citations {
        match citation {
            Citation::Path { path_score, node_ids, edge_ids } => {
                assert!(*path_score <= last_score);
                last_score = *path_score;
                assert!(node_ids.iter().all(|n| entity_ids.contains(&n.as_str())));
                assert!(edge_ids.iter().all(|e| relation_ids.contains(&e.as_str())));
            }
            other => panic!("expected path citation, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_theta_one_falls_back_to_vector() {
    // θ = 1.0 prunes every path; the configured fallback answers instead.
    let store = seeded_store("s4").await;
    let chat = MockChat::new().fallback("vector fallback answer");
    let svc = service(store, chat);

    let bundle = svc
        .query(
            "s4",
            "relation entre Acme et Beta",
            &QueryOptions {
                theta: Some(1.0),
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(bundle.mode_used, QueryMode::Vector);
    assert!(bundle.warnings.iter().any(|w| w.contains("vector fallback")));
}

#[tokio::test]
async fn test_vector_fulltext_fallback_citations() {
    // S6: embeddings disabled; the fulltext scan still yields cid-bearing
    // citations pointing at real chunks.
    let store = seeded_store("s5").await;
    let chat = MockChat::new().fallback("La couleur est bleue [cid=c1].");
    let svc = service(Arc::clone(&store), chat);

    let bundle = svc
        .query("s5", "logo couleur", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(bundle.mode_used, QueryMode::Vector);
    assert_eq!(bundle.citations.len(), 1);
    match &bundle.citations[0] {
        Citation::Vector { cid, doc, page, score } => {
            assert_eq!(cid, "c1");
            assert_eq!(doc.as_deref(), Some("report.pdf"));
            assert_eq!(*page, Some(2));
            assert!(*score > 0.0);
        }
        other => panic!("expected vector citation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_latency_and_debug_router_present() {
    let store = seeded_store("s6").await;
    let chat = MockChat::new().fallback("answer");
    let svc = service(store, chat);

    let bundle = svc
        .query("s6", "logo couleur", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(bundle.debug["router"]["rule"], "fallback/simple");
}
