//! The changesets under `demos/changesets` applied end to end.

use std::path::PathBuf;
use std::sync::Arc;

use docshift::loader::load_dir;
use docshift::runner::{Runner, Target};
use docshift::store::{MemoryStore, StoreAdapter};
use serde_json::{Map, Value, json};

fn demo_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join("changesets")
}

async fn role_groups(store: &MemoryStore, role_key: &str) -> Vec<(String, String)> {
    let filter: Map<String, Value> = json!({"roleKey": role_key}).as_object().cloned().unwrap();
    let roles = store.find("sk_uam_role", &filter).await.unwrap();
    assert_eq!(roles.len(), 1);
    roles[0]["permissionGroups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|group| {
            (
                group["permissionGroup"].as_str().unwrap().to_string(),
                group["accessLevel"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn demo_changesets_apply_in_order() {
    let changesets = load_dir(&demo_dir()).unwrap();
    assert_eq!(changesets.len(), 4);

    let store = Arc::new(MemoryStore::new());
    let runner = Runner::new(store.clone());
    let target = Target::new("dev").with_contexts(["app", "uam"]);

    let report = runner.apply(&target, changesets.clone()).await.unwrap();
    let applied: Vec<String> = report.applied.iter().map(ToString::to_string).collect();
    assert_eq!(applied, ["4", "4.1", "11", "12"]);

    let users = store.find("users", &Map::new()).await.unwrap();
    assert_eq!(users.len(), 2);
    let john = users.iter().find(|user| user["email"] == "john@example.com").unwrap();
    assert_eq!(john["age"], json!(31));
    assert!(john["lastUpdated"].is_string());

    let permissions = store.find("sk_uam_permission", &Map::new()).await.unwrap();
    assert_eq!(permissions.len(), 3);
    assert!(
        permissions
            .iter()
            .filter(|perm| perm["featureKey"] == "sp.benefits.benefits.benefits")
            .all(|perm| perm["createdBy"] == "1" && perm["createdAt"].is_string())
    );

    assert_eq!(
        role_groups(&store, "CONTENT_EDITOR").await,
        [
            ("sp.benefits.other.group".to_string(), "ALL".to_string()),
            ("sp.benefits.benefitguide.viewer".to_string(), "ALL".to_string()),
        ]
    );
    assert_eq!(
        role_groups(&store, "TALENT_PARTNER").await,
        [
            ("sp.benefits.other.group".to_string(), "ALL".to_string()),
            ("sp.benefits.benefitguide.tpviewer".to_string(), "ALL".to_string()),
        ]
    );

    let again = runner.apply(&target, changesets).await.unwrap();
    assert!(again.applied.is_empty());
}

#[tokio::test]
async fn demo_target_without_app_context_skips_users() {
    let store = Arc::new(MemoryStore::new());
    let runner = Runner::new(store.clone());
    let target = Target::new("uam").with_contexts(["uam"]);

    let report = runner.apply(&target, load_dir(&demo_dir()).unwrap()).await.unwrap();
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.filtered, 2);
    assert!(store.find("users", &Map::new()).await.unwrap().is_empty());
}
