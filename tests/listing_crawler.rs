mod fake_platform;

use fake_platform::{FakePlatform, quick_retry};
use quest_archiver::crawl::{CrawlRequest, crawl};
use quest_archiver::formats::{SortMode, TargetDescriptor};
use quest_archiver::target_list::SkipSet;

fn request(start_page: u32, end_page: u32) -> CrawlRequest {
    CrawlRequest {
        sort: SortMode::Active,
        start_page,
        end_page,
        skip_chat: false,
    }
}

fn ids(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("{prefix}{n}")).collect()
}

fn set_page(platform: &FakePlatform, page: u32, ids: &[String]) {
    let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
    platform.set_listing_page(page, &refs);
}

#[tokio::test]
async fn yields_every_story_until_the_first_empty_page() {
    let platform = FakePlatform::new();
    for page in 1..=3 {
        set_page(&platform, page, &ids(&format!("p{page}-"), 20));
    }
    let skip = SkipSet::default();

    let mut crawler = crawl(&platform, request(1, 1000), &skip, quick_retry(3));
    let mut seen = Vec::new();
    while let Some(target) = crawler.next().await.expect("crawl") {
        seen.push(target);
    }

    assert_eq!(seen.len(), 60);
    assert_eq!(seen[0], TargetDescriptor::story("p1-1", false));
    assert_eq!(seen[59].story_id, "p3-20");
    assert_eq!(platform.listing_pages_requested(), vec![1, 2, 3, 4]);
    assert_eq!(crawler.pages_fetched(), 4);
    assert!(crawler.next().await.expect("exhausted").is_none());
}

#[tokio::test]
async fn skip_list_and_repeats_are_filtered() {
    let platform = FakePlatform::new();
    platform.set_listing_page(1, &["a", "b", "c"]);
    platform.set_listing_page(2, &["c", "d"]);
    let skip = SkipSet::new(["b"]);

    let mut crawler = crawl(&platform, request(1, 10), &skip, quick_retry(0));
    let mut seen = Vec::new();
    while let Some(target) = crawler.next().await.expect("crawl") {
        seen.push(target.story_id);
    }

    assert_eq!(seen, vec!["a", "c", "d"]);
}

#[tokio::test]
async fn pages_are_fetched_only_on_demand() {
    let platform = FakePlatform::new();
    for page in 1..=3 {
        set_page(&platform, page, &ids(&format!("p{page}-"), 5));
    }
    let skip = SkipSet::default();

    let mut crawler = crawl(&platform, request(1, 1000), &skip, quick_retry(0));
    for _ in 0..5 {
        crawler.next().await.expect("crawl").expect("descriptor");
    }
    assert_eq!(platform.listing_pages_requested(), vec![1]);

    crawler.next().await.expect("crawl").expect("descriptor");
    assert_eq!(platform.listing_pages_requested(), vec![1, 2]);
}

#[tokio::test]
async fn page_range_bounds_the_walk() {
    let platform = FakePlatform::new();
    for page in 1..=4 {
        set_page(&platform, page, &ids(&format!("p{page}-"), 2));
    }
    let skip = SkipSet::default();

    let mut crawler = crawl(&platform, request(2, 3), &skip, quick_retry(0));
    let mut seen = Vec::new();
    while let Some(target) = crawler.next().await.expect("crawl") {
        seen.push(target.story_id);
    }

    assert_eq!(seen, vec!["p2-1", "p2-2", "p3-1", "p3-2"]);
    assert_eq!(platform.listing_pages_requested(), vec![2, 3]);
}

#[tokio::test]
async fn skip_chat_is_carried_into_descriptors() {
    let platform = FakePlatform::new();
    platform.set_listing_page(1, &["a"]);
    let skip = SkipSet::default();
    let mut request = request(1, 1);
    request.skip_chat = true;

    let mut crawler = crawl(&platform, request, &skip, quick_retry(0));
    let target = crawler.next().await.expect("crawl").expect("descriptor");

    assert!(target.skip_chat);
    assert_eq!(target.user, None);
}

#[tokio::test]
async fn failing_page_aborts_after_retries() {
    let platform = FakePlatform::new();
    set_page(&platform, 1, &ids("p1-", 20));
    platform.fail_listing_page(2);
    let skip = SkipSet::default();

    let mut crawler = crawl(&platform, request(1, 1000), &skip, quick_retry(2));
    for _ in 0..20 {
        crawler.next().await.expect("first page").expect("descriptor");
    }
    let err = crawler.next().await.expect_err("page 2 keeps failing");

    assert!(format!("{err:#}").contains("page 2"));
    assert_eq!(platform.listing_pages_requested(), vec![1, 2, 2, 2]);
    assert!(crawler.next().await.expect("finished").is_none());
}

#[tokio::test]
async fn last_possible_page_ends_the_crawl() {
    let platform = FakePlatform::new();
    platform.set_listing_page(u32::MAX, &["a"]);
    let skip = SkipSet::default();

    let mut crawler = crawl(&platform, request(u32::MAX, u32::MAX), &skip, quick_retry(0));

    let first = crawler.next().await.expect("crawl").expect("one story");
    assert_eq!(first.story_id, "a");
    assert!(crawler.next().await.expect("exhausted").is_none());
    assert!(crawler.next().await.expect("still exhausted").is_none());
    assert_eq!(platform.listing_pages_requested(), vec![u32::MAX]);
}
