use std::path::{Path, PathBuf};

use tgh_adapters::{fixture_bundle_path, load_fixture_bundle, FixtureConnector, SourceConnector, SourceIdentity};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[test]
fn demo_bundle_is_present_and_parses() {
    let path = fixture_bundle_path(&fixtures_root(), "@demo_channel");
    assert!(path.exists(), "missing {}", path.display());
    let bundle = load_fixture_bundle(&path).expect("bundle parses");
    assert_eq!(bundle.group, "@demo_channel");
    assert!(bundle.messages.iter().any(|m| m.date.is_none()));
}

#[tokio::test]
async fn demo_bundle_iterates_top_level_posts_newest_first() {
    let session = FixtureConnector::from_dir(fixtures_root())
        .connect(&SourceIdentity::default())
        .await
        .expect("connect");

    let mut cursor = session.iterate("@demo_channel", "").await.expect("iterate");
    let mut ids = Vec::new();
    while let Some(message) = cursor.next_message().await.expect("next") {
        ids.push(message.id);
    }
    assert_eq!(ids, vec![1207, 1206, 1205, 1204, 1203, 1202, 1201]);

    let replies = session.replies("demo_channel", 1206).await.expect("replies");
    assert_eq!(replies.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1311, 1310]);
}
