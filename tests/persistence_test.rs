//! BM25 persistence round trip across a simulated restart.

use kb_core::bm25::{Bm25Doc, Bm25IndexManager};
use kb_core::config::Bm25Config;
use kb_core::repository::memory::MemoryRepository;

fn chunk(i: usize, content: &str) -> Bm25Doc {
    Bm25Doc {
        chunk_id: format!("c{i}"),
        doc_id: "doc-1".to_string(),
        chunk_index: i as i32,
        content: content.to_string(),
        page: None,
        section_title: None,
    }
}

#[tokio::test]
async fn test_flush_restart_load_search() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = Bm25Config::default();

    // Ten chunks; only chunk 7 contains the rare token.
    let docs: Vec<Bm25Doc> = (0..10)
        .map(|i| {
            if i == 7 {
                chunk(i, "operational notes mention the quuxfragment marker here")
            } else {
                chunk(i, &format!("ordinary filler content number {i} about systems"))
            }
        })
        .collect();

    {
        let manager = Bm25IndexManager::new(dir.path().to_path_buf(), &config);
        manager.upsert("kb2", &docs).await;
        manager.flush("kb2").await.unwrap();
    }

    // Restart: new manager, empty repository. If the index were rebuilt
    // instead of loaded, it would come back empty.
    let manager = Bm25IndexManager::new(dir.path().to_path_buf(), &config);
    let empty_repo = MemoryRepository::new();
    let index = manager.get_or_build("kb2", &empty_repo).await.unwrap();
    assert_eq!(index.read().await.len(), 10);

    let hits = manager.search("kb2", "quuxfragment", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, "c7");
    assert!(hits[0].score > 0.0);
}

#[tokio::test]
async fn test_periodic_flush_task_persists() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = Bm25Config::default();
    let manager = std::sync::Arc::new(Bm25IndexManager::new(dir.path().to_path_buf(), &config));

    manager.upsert("kb1", &[chunk(0, "periodic flush check")]).await;
    let handle = manager.clone().spawn_flush_task(std::time::Duration::from_millis(20));

    // Wait for at least one tick past the initial immediate one.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    handle.abort();

    assert!(dir.path().join("kb1.idx").exists());
}
