use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

// Thin wrapper over reqwest for a running server
struct TestClient {
    client: Client,
    base_url: String,
}

impl TestClient {
    fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }

    async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .get(&format!("{}{}", self.base_url, path))
            .send()
            .await
    }

    async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .delete(&format!("{}{}", self.base_url, path))
            .send()
            .await
    }
}

#[tokio::test]
async fn test_live_server_smoke() {
    // Runs only against a deployed server backed by PostgreSQL, e.g.
    // TEST_API_BASE_URL=http://localhost:3010 TEST_WORKSPACE_ID=1 cargo test --test live_server
    let Ok(base_url) = std::env::var("TEST_API_BASE_URL") else {
        println!("TEST_API_BASE_URL not set, skipping live server test");
        return;
    };
    let workspace: i64 = std::env::var("TEST_WORKSPACE_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let client = TestClient::new(base_url);

    println!("0. Waiting for the server...");
    let mut retries = 0;
    loop {
        match client.get("/health").await {
            Ok(response) if response.status().is_success() => break,
            _ if retries < 30 => {
                retries += 1;
                sleep(Duration::from_secs(1)).await;
            }
            other => panic!("Server did not become healthy: {:?}", other.map(|r| r.status())),
        }
    }

    println!("1. Validating an expected combination that cannot exist...");
    let response = client
        .post(
            &format!("/workspaces/{}/validation", workspace),
            json!({
                "expectedCombinations": [{
                    "unitKey": "__no_such_unit__",
                    "loginName": "nobody",
                    "loginCode": "none",
                    "bookletId": "none",
                    "variableId": "none"
                }]
            }),
        )
        .await
        .expect("validation request");
    assert_eq!(response.status(), 200);
    let page: Value = response.json().await.expect("validation body");
    assert_eq!(page["missing"], 1);
    let key = page["cacheKey"].as_str().expect("cache key").to_string();

    let response = client
        .delete(&format!("/workspaces/{}/validation/{}", workspace, key))
        .await
        .expect("delete request");
    assert_eq!(response.status(), 200);

    println!("2. Reading statistics and jobs...");
    let response = client
        .get(&format!("/workspaces/{}/statistics", workspace))
        .await
        .expect("statistics request");
    assert_eq!(response.status(), 200);
    let stats: Value = response.json().await.expect("statistics body");
    assert!(stats["totalResponses"].is_u64());

    let response = client
        .get(&format!("/workspaces/{}/coding-jobs", workspace))
        .await
        .expect("jobs request");
    assert_eq!(response.status(), 200);

    println!("3. Rejecting an allocation without coders...");
    let response = client
        .post(
            &format!("/workspaces/{}/coding-jobs/distributed", workspace),
            json!({
                "selectedVariables": [{"unitName": "__no_such_unit__", "variableId": "none"}],
                "selectedCoders": []
            }),
        )
        .await
        .expect("allocation request");
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"], "coding-job.allocation.no-coders");

    println!("Live server smoke test passed");
}
