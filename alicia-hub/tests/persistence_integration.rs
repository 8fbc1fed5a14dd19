//! Durability tests: graph state written through the hub survives a
//! restart of the RocksDB-backed store.

use std::sync::Arc;

use alicia_hub::client::HubClient;
use alicia_hub::graph::{GraphStore, MessageDraft, MessageGraph, RocksStore, StoreConfig, ToolUseStatus};
use alicia_hub::protocol::{
    AssistantMessage, MessageType, Subscribe, ToolUseRequest, ToolUseResult, UserMessage,
};
use alicia_hub::server::{HubServer, ServerConfig};
use serde_json::json;
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn reopen(path: &std::path::Path) -> MessageGraph {
    let store = RocksStore::open(StoreConfig::for_testing(path)).unwrap();
    MessageGraph::new(Arc::new(store))
}

#[tokio::test]
async fn test_hub_traffic_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().to_path_buf()),
        ..ServerConfig::for_testing()
    };
    let server = HubServer::open(config).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let router = server.router().clone();
    let shutdown = server.shutdown_token();
    let running = tokio::spawn(async move { server.run().await });

    let conv = router.graph().create_conversation("durable").unwrap().id;

    let mut agent = HubClient::connect(&url, None).await.unwrap();
    assert!(agent.subscribe(Subscribe::agent()).await.unwrap().success);
    let client = HubClient::connect(&url, None).await.unwrap();

    let question = UserMessage {
        conversation_id: conv.clone(),
        content: "dim the lights".into(),
        ..UserMessage::default()
    };
    client
        .send(&conv, MessageType::UserMessage, &question)
        .await
        .unwrap();

    let request = agent
        .recv_type(MessageType::GenerationRequest, WAIT)
        .await
        .unwrap()
        .body::<alicia_hub::protocol::GenerationRequest>()
        .unwrap();

    let tool = ToolUseRequest {
        id: "tu_dim".into(),
        message_id: "msg_dimmed".into(),
        conversation_id: conv.clone(),
        tool_name: "lights".into(),
        arguments: json!({"level": 30}).as_object().cloned().unwrap_or_default(),
        ..ToolUseRequest::default()
    };
    agent.send(&conv, MessageType::ToolUseRequest, &tool).await.unwrap();

    let result = ToolUseResult {
        id: "tur_dim".into(),
        request_id: "tu_dim".into(),
        conversation_id: conv.clone(),
        success: true,
        result: Some(json!({"level": 30})),
        ..ToolUseResult::default()
    };
    agent.send(&conv, MessageType::ToolUseResult, &result).await.unwrap();

    let answer = AssistantMessage {
        id: "msg_dimmed".into(),
        conversation_id: conv.clone(),
        content: "Dimmed to 30%.".into(),
        previous_id: Some(request.message_id.clone()),
        ..AssistantMessage::default()
    };
    agent
        .send(&conv, MessageType::AssistantMessage, &answer)
        .await
        .unwrap();

    // wait until the answer is persisted
    let deadline = tokio::time::Instant::now() + WAIT;
    while router.graph().get_message("msg_dimmed").is_err() {
        assert!(tokio::time::Instant::now() < deadline, "answer never persisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    running.await.unwrap().unwrap();
    drop(agent);
    drop(client);
    drop(router);

    // connection tasks hold the store until they observe the shutdown
    let deadline = tokio::time::Instant::now() + WAIT;
    let store = loop {
        match RocksStore::open(StoreConfig::for_testing(dir.path())) {
            Ok(store) => break store,
            Err(e) => {
                assert!(tokio::time::Instant::now() < deadline, "store still locked: {e}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    };
    let graph = MessageGraph::new(Arc::new(store));
    let chain = graph.active_chain(&conv).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].id, request.message_id);
    assert_eq!(chain[0].content, "dim the lights");
    assert_eq!(chain[1].id, "msg_dimmed");

    let tool_use = graph.store().get_tool_use("tu_dim").unwrap();
    assert_eq!(tool_use.status, ToolUseStatus::Success);
    assert_eq!(tool_use.result, Some(json!({"level": 30})));
    assert_eq!(graph.tool_uses_for_message("msg_dimmed").unwrap().len(), 1);
}

#[test]
fn test_branch_switch_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (conv, b_id, c_id) = {
        let graph = reopen(dir.path());
        let conv = graph.create_conversation("branches").unwrap().id;
        let a = graph.create_message(&conv, MessageDraft::user("A")).unwrap();
        let b = graph.create_message(&conv, MessageDraft::assistant("B")).unwrap();
        let c = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("C"))
            .unwrap();
        graph.switch_branch(&conv, &b.id).unwrap();
        (conv, b.id, c.id)
    };

    let graph = reopen(dir.path());
    let chain = graph.active_chain(&conv).unwrap();
    assert_eq!(chain.last().map(|m| m.id.as_str()), Some(b_id.as_str()));

    let siblings: Vec<_> = graph
        .get_siblings(&b_id)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(siblings, vec![c_id.clone()]);
    assert_eq!(graph.get_message(&c_id).unwrap().branch_index, 1);
}
