use polymock::protocol::graphql::{GraphqlOutcome, GraphqlRequest};
use polymock::protocol::grpc::{GrpcSpec, MethodConfig};
use polymock::protocol::http::{HttpAction, HttpMatcher, HttpRequest, HttpResponse, HttpSpec};
use polymock::protocol::websocket::WsReply;
use polymock::sse::SseEvent;
use polymock::stateful::{CrudAction, StatefulBinding};
use polymock::{
    CreateOptions, EngineConfig, HttpOutcome, HttpReply, MergeAction, Mock, MockCollection,
    MockEngine, MockSpec, MockType, SseConfig, StatefulResourceConfig,
};
use serde_json::json;
use std::sync::Arc;

fn http_mock(method: &str, path: &str, body: &str) -> Mock {
    Mock::new(MockSpec::Http(HttpSpec::new(
        HttpMatcher::exact(method, path),
        HttpAction::Respond(HttpResponse::new(200, body)),
    )))
}

fn http_spec(matcher: HttpMatcher, body: &str, priority: i32) -> Mock {
    Mock::new(MockSpec::Http(
        HttpSpec::new(matcher, HttpAction::Respond(HttpResponse::new(200, body)))
            .with_priority(priority),
    ))
}

async fn body_of(engine: &MockEngine, request: HttpRequest) -> String {
    reply_of(engine, request).await.body
}

async fn reply_of(engine: &MockEngine, request: HttpRequest) -> HttpReply {
    match engine.handle_http(&request).await.unwrap() {
        HttpOutcome::Reply(reply) => reply,
        HttpOutcome::Stream(_) => panic!("expected a reply"),
    }
}

fn duplicate() -> CreateOptions {
    CreateOptions {
        allow_duplicate: true,
    }
}

#[tokio::test]
async fn matcher_never_selects_wrong_discriminator() {
    let engine = MockEngine::default();
    for (method, path) in [("GET", "/a"), ("POST", "/a"), ("GET", "/b"), ("DELETE", "/c")] {
        engine
            .create_mock(
                http_mock(method, path, &format!("{method} {path}")),
                CreateOptions::default(),
            )
            .unwrap();
    }

    for (method, path) in [("GET", "/a"), ("post", "/a"), ("GET", "/b"), ("DELETE", "/c")] {
        let body = body_of(&engine, HttpRequest::new(method, path)).await;
        assert_eq!(body, format!("{} {path}", method.to_uppercase()));
    }
    assert!(engine
        .handle_http(&HttpRequest::new("PUT", "/a"))
        .await
        .unwrap_err()
        .is_no_match());
}

#[tokio::test]
async fn priority_then_specificity_then_registration_order() {
    let engine = MockEngine::default();
    engine
        .create_mock(
            http_spec(HttpMatcher::exact("GET", "/items"), "general", 0),
            duplicate(),
        )
        .unwrap();
    engine
        .create_mock(
            http_spec(
                HttpMatcher::exact("GET", "/items").with_header("X-Tenant", "acme"),
                "specific",
                0,
            ),
            duplicate(),
        )
        .unwrap();

    let request = HttpRequest::new("GET", "/items").with_header("x-tenant", "acme");
    assert_eq!(body_of(&engine, request.clone()).await, "specific");
    assert_eq!(
        body_of(&engine, HttpRequest::new("GET", "/items")).await,
        "general"
    );

    // Registered last, but a higher priority beats specificity.
    engine
        .create_mock(
            http_spec(HttpMatcher::pattern("GET", "^/items$").unwrap(), "urgent", 10),
            duplicate(),
        )
        .unwrap();
    assert_eq!(body_of(&engine, request.clone()).await, "urgent");

    // Full tie: the earlier registration keeps winning.
    engine
        .create_mock(
            http_spec(HttpMatcher::pattern("GET", "^/it").unwrap(), "later", 10),
            duplicate(),
        )
        .unwrap();
    for _ in 0..5 {
        assert_eq!(body_of(&engine, request.clone()).await, "urgent");
    }
}

#[test]
fn recreate_same_route_updates_unless_duplicates_allowed() {
    let engine = MockEngine::default();
    let first = engine
        .create_mock(http_mock("GET", "/x", "one"), CreateOptions::default())
        .unwrap();
    assert_eq!(first.action, MergeAction::Created);

    let second = engine
        .create_mock(http_mock("GET", "/x", "two"), CreateOptions::default())
        .unwrap();
    assert_eq!(second.action, MergeAction::Updated);
    assert_eq!(second.mock.id, first.mock.id);
    assert_eq!(engine.list_mocks(None).len(), 1);

    let third = engine
        .create_mock(http_mock("GET", "/x", "three"), duplicate())
        .unwrap();
    assert_eq!(third.action, MergeAction::Created);
    assert_eq!(engine.list_mocks(None).len(), 2);
}

#[test]
fn grpc_on_shared_port_merges() {
    let engine = MockEngine::default();
    let a = GrpcSpec::new(50051).with_method("svc.A", "Get", MethodConfig::responding(json!({"a": 1})));
    let created = engine
        .create_mock(Mock::new(MockSpec::Grpc(a)), CreateOptions::default())
        .unwrap();

    let b = GrpcSpec::new(50051).with_method("svc.B", "List", MethodConfig::responding(json!([])));
    let merged = engine
        .create_mock(Mock::new(MockSpec::Grpc(b)), CreateOptions::default())
        .unwrap();

    assert_eq!(merged.action, MergeAction::Merged);
    let details = merged.details.unwrap();
    assert_eq!(details.target_id, created.mock.id);
    assert_eq!(details.added_services, vec!["svc.B".to_string()]);

    let stored = engine.get_mock(&created.mock.id).unwrap();
    let spec = stored.as_grpc().unwrap();
    assert!(spec.method("svc.A", "Get").is_some());
    assert!(spec.method("svc.B", "List").is_some());
    assert_eq!(engine.list_mocks(Some(MockType::Grpc)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sse_template_repeat_emits_exactly_six_events() {
    let engine = MockEngine::default();
    let sse = SseConfig::template(vec![SseEvent::data("e1"), SseEvent::data("e2")], 3).with_delay_ms(5);
    engine
        .create_mock(
            Mock::new(MockSpec::Http(HttpSpec::new(
                HttpMatcher::exact("GET", "/events"),
                HttpAction::Stream(sse),
            ))),
            CreateOptions::default(),
        )
        .unwrap();

    let HttpOutcome::Stream(mut stream) = engine
        .handle_http(&HttpRequest::new("GET", "/events"))
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };

    let mut data = Vec::new();
    while let Some(frame) = stream.next_frame().await {
        data.extend(frame.data().map(String::from));
    }
    assert_eq!(data, vec!["e1", "e2", "e1", "e2", "e1", "e2"]);
}

#[tokio::test(start_paused = true)]
async fn sse_endless_stream_stops_after_shutdown() {
    let engine = MockEngine::default();
    let sse = SseConfig::template(vec![SseEvent::data("tick")], 0).with_delay_ms(5);
    engine
        .create_mock(
            Mock::new(MockSpec::Http(HttpSpec::new(
                HttpMatcher::exact("GET", "/ticks"),
                HttpAction::Stream(sse),
            ))),
            CreateOptions::default(),
        )
        .unwrap();

    let HttpOutcome::Stream(mut stream) = engine
        .handle_http(&HttpRequest::new("GET", "/ticks"))
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    for _ in 0..20 {
        assert_eq!(stream.next_frame().await.unwrap().data(), Some("tick"));
    }
    engine.shutdown();
    assert!(stream.next_frame().await.is_none());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(stream.next_frame().await.is_none());
}

#[tokio::test]
async fn stateful_crud_through_http() {
    let engine = MockEngine::default();
    engine
        .register_stateful_resource(StatefulResourceConfig::new("notes", "/notes"))
        .unwrap();
    let bind = |method: &str, path: &str, action: CrudAction| {
        let matcher = if path.contains('(') {
            HttpMatcher::pattern(method, path).unwrap()
        } else {
            HttpMatcher::exact(method, path)
        };
        Mock::new(MockSpec::Http(HttpSpec::new(
            matcher,
            HttpAction::Stateful(StatefulBinding::crud("notes", action)),
        )))
    };
    for mock in [
        bind("GET", "/notes", CrudAction::List),
        bind("POST", "/notes", CrudAction::Create),
        bind("GET", r"^/notes/(?P<id>\w+)$", CrudAction::Get),
        bind("DELETE", r"^/notes/(?P<id>\w+)$", CrudAction::Delete),
    ] {
        engine.create_mock(mock, CreateOptions::default()).unwrap();
    }

    for (id, text) in [("n1", "first"), ("n2", "second"), ("n3", "third")] {
        let created = reply_of(
            &engine,
            HttpRequest::new("POST", "/notes")
                .with_body(json!({"id": id, "text": text}).to_string()),
        )
        .await;
        assert_eq!(created.status_code, 201);
    }

    let fetched = reply_of(&engine, HttpRequest::new("GET", "/notes/n2")).await;
    assert_eq!(fetched.body_json().unwrap(), json!({"id": "n2", "text": "second"}));

    let listed = reply_of(&engine, HttpRequest::new("GET", "/notes")).await;
    let ids: Vec<_> = listed
        .body_json()
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["n1", "n2", "n3"]);

    assert_eq!(reply_of(&engine, HttpRequest::new("DELETE", "/notes/n2")).await.status_code, 204);
    assert_eq!(reply_of(&engine, HttpRequest::new("GET", "/notes/n2")).await.status_code, 404);

    // Deleting the mocks leaves the resource alone.
    for mock in engine.list_mocks(None) {
        engine.delete_mock(&mock.id).unwrap();
    }
    assert_eq!(engine.stateful_resources(), vec!["notes".to_string()]);
}

#[test]
fn export_then_import_reproduces_mocks() {
    let source = MockEngine::default();
    source
        .create_mock(http_mock("GET", "/a", "a").with_name("alpha"), CreateOptions::default())
        .unwrap();
    source
        .create_mock(
            Mock::new(MockSpec::Grpc(
                GrpcSpec::new(50051).with_method("svc.A", "Get", MethodConfig::default()),
            )),
            CreateOptions::default(),
        )
        .unwrap();
    source
        .register_stateful_resource(
            StatefulResourceConfig::new("users", "/users").with_record(json!({"id": "1"})),
        )
        .unwrap();

    let yaml = source.export_config(Some("snapshot")).to_yaml().unwrap();
    let collection = MockCollection::from_yaml(&yaml).unwrap();
    assert_eq!(collection.name.as_deref(), Some("snapshot"));

    let target = MockEngine::default();
    let summary = target.import_config(collection, true).unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.total, 2);

    let before = source.list_mocks(None);
    let after = target.list_mocks(None);
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.id, a.id);
        assert_eq!(b.name, a.name);
        assert_eq!(b.spec, a.spec);
        assert_eq!(b.created_at, a.created_at);
    }
    assert_eq!(target.stateful_resources(), vec!["users".to_string()]);
}

#[test]
fn import_without_replace_keeps_existing_mocks() {
    let engine = MockEngine::default();
    engine
        .create_mock(http_mock("GET", "/kept", "kept"), CreateOptions::default())
        .unwrap();
    let collection = MockCollection {
        mocks: vec![http_mock("GET", "/new", "new").with_id("new")],
        ..MockCollection::default()
    };
    let summary = engine.import_config(collection, false).unwrap();
    assert_eq!(summary.imported, 1);
    assert_eq!(summary.total, 2);
    assert!(engine.get_mock("new").is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lists_never_see_partial_updates() {
    let engine = Arc::new(MockEngine::default());
    let id = engine
        .create_mock(
            http_spec(
                HttpMatcher::exact("GET", "/old").with_header("X-Old", "1"),
                "old",
                1,
            ),
            CreateOptions::default(),
        )
        .unwrap()
        .mock
        .id
        .clone();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                for _ in 0..500 {
                    for mock in engine.list_mocks(None) {
                        let spec = mock.as_http().unwrap();
                        let HttpAction::Respond(response) = &spec.action else {
                            panic!("unexpected action");
                        };
                        let old = (
                            spec.matcher.method.as_str(),
                            spec.matcher.path.as_str(),
                            spec.matcher.headers.len(),
                            response.body.as_str(),
                            spec.priority,
                        );
                        assert!(
                            old == ("GET", "/old", 1, "old", 1) || old == ("POST", "/new", 0, "new", 2),
                            "torn read: {old:?}"
                        );
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    engine
        .update_mock(&id, http_spec(HttpMatcher::exact("POST", "/new"), "new", 2))
        .unwrap();

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(engine.get_mock(&id).unwrap().as_http().unwrap().priority, 2);
}

#[tokio::test]
async fn engine_from_config_file_serves_all_protocols() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
settings:
  logMatches: false
mocks:
  - id: greet
    type: http
    http:
      matcher:
        method: GET
        pathPattern: ^/greet/(?P<name>\w+)$
      response:
        statusCode: 200
        body: "Hello, {{{{captures.name}}}}"
  - id: chat
    type: websocket
    websocket:
      path: /chat
      echoMode: true
      matchers:
        - match: {{type: exact, value: ping}}
          response: {{type: text, value: pong}}
  - id: gql
    type: graphql
    graphql:
      path: /graphql
      resolvers:
        Query.user:
          response: {{id: "{{{{variables.id}}}}", name: Ada}}
statefulResources:
  - name: users
    basePath: /api/users
    records:
      - {{id: "1", name: Ada}}
"#
    )
    .unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert!(!config.settings.log_matches);
    let engine = MockEngine::from_config(config).unwrap();
    assert_eq!(engine.list_mocks(None).len(), 3);

    assert_eq!(
        body_of(&engine, HttpRequest::new("GET", "/greet/ada")).await,
        "Hello, ada"
    );

    assert_eq!(
        engine.handle_websocket("/chat", "ping").unwrap(),
        WsReply::Message("pong".into())
    );
    assert_eq!(
        engine.handle_websocket("/chat", "hello").unwrap(),
        WsReply::Echo("hello".into())
    );

    let outcome = engine
        .handle_graphql(
            "/graphql",
            &GraphqlRequest::new("query GetUser($id: ID!) { user(id: $id) { id name } }")
                .with_variables(json!({"id": "7"})),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        GraphqlOutcome::Response(json!({"data": {"user": {"id": "7", "name": "Ada"}}}))
    );

    let missing = engine
        .handle_graphql("/graphql", &GraphqlRequest::new("{ orders { id } }"))
        .await
        .unwrap();
    let GraphqlOutcome::Response(body) = missing else {
        panic!("expected a response body");
    };
    assert!(body["errors"][0]["message"]
        .as_str()
        .unwrap()
        .contains("Query.orders"));

    assert_eq!(engine.stateful_resources(), vec!["users".to_string()]);
}
