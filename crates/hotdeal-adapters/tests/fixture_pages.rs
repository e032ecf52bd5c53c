use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use hotdeal_adapters::{normalize, AdapterError, AdapterRegistry, SiteAdapter};
use hotdeal_core::{Category, IdentityMode, SiteId};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn ppomppu_fixture_pages_normalize() {
    let registry = AdapterRegistry::fixture_backed(fixtures_root());
    let adapter = registry.get(SiteId::Ppomppu).expect("ppomppu adapter");
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).single().unwrap();

    let page = adapter.fetch_page(1).await.expect("page 1");
    assert_eq!(page.len(), 3);
    let drafts: Vec<_> = page.iter().map(|r| normalize(SiteId::Ppomppu, r, now)).collect();

    assert_eq!(drafts[0].source_post_id, "581234");
    assert_eq!(drafts[0].price, 189_000);
    assert_eq!(drafts[0].seller, "쿠팡");
    assert_eq!(drafts[0].category, Category::Electronics);

    assert_eq!(drafts[1].price, 30_000);
    assert_eq!(drafts[1].original_price, Some(50_000));
    assert_eq!(drafts[1].discount_rate, Some(40));
    assert_eq!(drafts[1].category, Category::Food);

    assert_eq!(drafts[2].source_post_id, "581219");
    assert_eq!(drafts[2].identity_mode, IdentityMode::SourceId);
    assert!(drafts[2].ended);

    let detail = adapter.fetch_detail(&drafts[0].original_url).await.unwrap();
    assert!(detail.description.is_some());

    assert!(adapter.fetch_page(3).await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_fixture_pages_report_adapter_errors() {
    let registry = AdapterRegistry::fixture_backed(fixtures_root());

    let clien = registry.get(SiteId::Clien).unwrap();
    assert_eq!(clien.fetch_page(1).await.unwrap().len(), 1);
    assert!(matches!(clien.fetch_page(2).await, Err(AdapterError::Network(_))));

    let ruliweb = registry.get(SiteId::Ruliweb).unwrap();
    assert!(matches!(ruliweb.fetch_page(1).await, Err(AdapterError::RateLimited(_))));
}

#[tokio::test]
async fn quasarzone_status_label_and_store_survive_normalization() {
    let registry = AdapterRegistry::fixture_backed(fixtures_root());
    let adapter = registry.get(SiteId::Quasarzone).unwrap();
    let now = Utc::now();

    let drafts: Vec<_> = adapter
        .fetch_page(1)
        .await
        .unwrap()
        .iter()
        .map(|r| normalize(SiteId::Quasarzone, r, now))
        .collect();

    assert_eq!(drafts.len(), 2);
    assert!(!drafts[0].ended);
    assert!(drafts[0].end_date.is_some());
    assert_eq!(drafts[0].seller, "11번가");
    assert!(drafts[1].ended);
    assert_eq!(drafts[1].seller, "아마존");
}
