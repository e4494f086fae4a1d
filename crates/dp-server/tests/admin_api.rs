mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use dp_core::error::RemoteError;

use common::{admin, user, Harness};

#[tokio::test]
async fn admin_routes_reject_regular_users() {
    let h = Harness::new();
    for uri in ["/admin/deployments", "/admin/docker-hosts", "/admin/database-servers"] {
        let (status, body) = h.send(Method::GET, uri, Some(&user("alice")), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(body["details"], "Admin access required");
    }
    let (status, _) = h.send(Method::GET, "/admin/docker-hosts", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn docker_host_crud_never_echoes_password() {
    let h = Harness::new();
    let root = admin();
    let (status, body) = h
        .send(
            Method::POST,
            "/admin/docker-hosts",
            Some(&root),
            Some(json!({
                "name": "edge",
                "host": "10.0.0.9",
                "user": "deploy",
                "password": "hunter2",
                "testConnection": true,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["host"]["hasPassword"], true);
    assert!(body["host"].get("password").is_none());
    let id = body["host"]["id"].as_str().unwrap().to_string();
    assert!(h.executor.commands_on("10.0.0.9").iter().any(|c| c.contains("echo ok")));

    let (status, _) = h
        .send(
            Method::POST,
            "/admin/docker-hosts",
            Some(&root),
            Some(json!({ "name": "dup", "host": "10.0.0.9", "user": "deploy" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = h
        .send(
            Method::PUT,
            &format!("/admin/docker-hosts/{id}"),
            Some(&root),
            Some(json!({ "isActive": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host"]["isActive"], false);
    assert_eq!(body["host"]["name"], "edge");

    let (_, body) = h.send(Method::GET, "/admin/docker-hosts", Some(&root), None).await;
    assert_eq!(body["hosts"][0]["deploymentCount"], 0);
    assert!(!body.to_string().contains("hunter2"));

    let (status, _) = h
        .send(Method::DELETE, &format!("/admin/docker-hosts/{id}"), Some(&root), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rejected_credentials_map_to_bad_gateway() {
    let h = Harness::new();
    h.executor.fail(
        "echo ok",
        RemoteError::PermissionDenied {
            target: "deploy@10.0.0.9".into(),
        },
    );
    let (status, body) = h
        .send(
            Method::POST,
            "/admin/docker-hosts",
            Some(&admin()),
            Some(json!({ "name": "edge", "host": "10.0.0.9", "user": "deploy", "testConnection": true })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Authentication failed");

    let (_, body) = h.send(Method::GET, "/admin/docker-hosts", Some(&admin()), None).await;
    assert_eq!(body["hosts"], json!([]));
}

#[tokio::test]
async fn database_server_is_tested_before_it_is_stored() {
    let h = Harness::new();
    let root = admin();
    h.admin.fail_connect(true);
    let server = json!({
        "name": "primary",
        "host": "db.internal",
        "dbType": "mysql",
        "rootUser": "root",
        "rootPass": "rootpw",
    });
    let (status, _) = h
        .send(Method::POST, "/admin/database-servers", Some(&root), Some(server.clone()))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    h.admin.fail_connect(false);
    let (status, body) = h
        .send(Method::POST, "/admin/database-servers", Some(&root), Some(server))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["server"]["port"], 3306);
    assert!(body["server"].get("rootPass").is_none());
}

#[tokio::test]
async fn move_requires_a_target_host() {
    let h = Harness::new();
    let alice = user("alice");
    let (_, body) = h
        .send(
            Method::POST,
            "/deploy",
            Some(&alice),
            Some(json!({ "gitUrl": "https://github.com/alice/shop.git" })),
        )
        .await;
    let id: Uuid = body["deployment"]["id"].as_str().unwrap().parse().unwrap();
    h.platform.pipeline().wait(id).await;

    let uri = format!("/admin/deployments/{id}/move");
    let (status, body) = h.send(Method::POST, &uri, Some(&admin()), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "Missing required fields: newHostId");

    let (status, body) = h
        .send(Method::POST, "/admin/docker-hosts", Some(&admin()), Some(json!({
            "name": "edge", "host": "10.0.0.9", "user": "deploy",
        })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let host_id = body["host"]["id"].as_str().unwrap().to_string();

    let (status, body) = h
        .send(Method::POST, &uri, Some(&admin()), Some(json!({ "newHostId": host_id })))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["host"]["name"], "edge");
    assert_eq!(body["deployment"]["status"], "running");
    assert!(h.executor.containers_on(common::DEFAULT_HOST).is_empty());
    assert_eq!(h.executor.containers_on("10.0.0.9").len(), 1);

    let (_, body) = h.send(Method::GET, "/admin/deployments", Some(&admin()), None).await;
    assert_eq!(body["deployments"][0]["hostId"], host_id);
}
