mod common;

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

use common::{CountingResolver, FakeHttp, FakePdf};
use sourcewatch::config::Config;
use sourcewatch::constants::{KEY_DOWNLOAD_STATS, KEY_PERSIST_STATS};
use sourcewatch::domain::{DownloadStatus, PipelineContext, Record};
use sourcewatch::error::PipelineError;
use sourcewatch::idempotency::record_fingerprint;
use sourcewatch::pipeline::processing::transforms::{Cached, StorageProvider, UrlResolver};
use sourcewatch::pipeline::storage::{DedupStore, InMemoryStore, SqliteStateStore};
use sourcewatch::pipeline::{PipelineDeps, PipelineRunner, RunOptions};

const SOURCE: &str = "https://city.example.org/notices/?page=1";

const NOTICES: &str = r#"
    template_name = "city-notices"

    [source]
    type = "html"
    url = "https://city.example.org/notices/?page=1"

    [extract.events]
    selector = ".item"

    [extract.events.fields]
    title = "self"
    url = "href"
"#;

const LISTING: &str = r#"<html><body>
    <a class="item" href="/docs/1.pdf">Road closure on Main street</a>
    <a class="item" href="/docs/2.pdf">   </a>
</body></html>"#;

fn config(toml: &str) -> Arc<Config> {
    Arc::new(Config::from_toml_str(toml).expect("template should parse"))
}

async fn run_once(toml: &str, http: Arc<FakeHttp>, store: Arc<SqliteStateStore>) -> Result<PipelineContext> {
    let deps = PipelineDeps::new(http, store).with_pdf(Arc::new(FakePdf));
    let runner = PipelineRunner::new(config(toml), deps)?;
    Ok(runner.run().await?)
}

#[tokio::test]
async fn html_source_yields_titled_records_with_resolved_urls() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);
    let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", LISTING));

    let ctx = run_once(NOTICES, http, store).await?;

    let events = ctx.block("events").expect("events block");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].title.as_deref(), Some("Road closure on Main street"));
    assert_eq!(events[0].url_final.as_deref(), Some("https://city.example.org/docs/1.pdf"));
    Ok(())
}

#[tokio::test]
async fn second_run_over_same_document_adds_no_events() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);
    let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", LISTING));

    let first = run_once(NOTICES, http.clone(), store.clone()).await?;
    assert_eq!(first.meta(KEY_PERSIST_STATS).unwrap()["saved"], json!(1));
    assert_eq!(store.count().await?, 1);

    let second = run_once(NOTICES, http, store.clone()).await?;
    assert_eq!(second.meta(KEY_PERSIST_STATS).unwrap()["saved"], json!(0));
    assert_eq!(second.meta(KEY_PERSIST_STATS).unwrap()["known"], json!(1));
    assert!(second.block("events").unwrap().is_empty());
    assert_eq!(store.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn records_without_links_do_not_collapse_into_one_event() -> Result<()> {
    let toml = r#"
        template_name = "city-bulletins"

        [source]
        type = "html"
        url = "https://city.example.org/notices/?page=1"

        [extract.events]
        selector = ".item"

        [extract.events.fields]
        title = "self"
    "#;
    let page = r#"<ul>
        <li class="item">Budget hearing</li>
        <li class="item">Road works</li>
        <li class="item">Water outage</li>
    </ul>"#;
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);
    let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", page));

    let ctx = run_once(toml, http, store.clone()).await?;

    let stats = ctx.meta(KEY_PERSIST_STATS).unwrap();
    assert_eq!(stats["saved"], json!(0));
    assert_eq!(stats["known"], json!(0));
    assert_eq!(stats["skipped_no_url"], json!(3));
    assert_eq!(store.count().await?, 0);
    assert!(!store.exists_by_url("").await?);
    Ok(())
}

#[tokio::test]
async fn downloaded_pdf_is_processed_then_skipped_on_rerun() -> Result<()> {
    let toml = format!(
        "{NOTICES}\n[download]\nretry_delay_ms = 0\n\n[processing]\ntext_max_chars = 500\n"
    );
    let pdf_url = "https://city.example.org/docs/1.pdf";
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);
    let http = Arc::new(
        FakeHttp::new()
            .page(SOURCE, "text/html", LISTING)
            .page(pdf_url, "application/pdf", "%PDF-Main street closed from 1 May"),
    );

    let first = run_once(&toml, http.clone(), store.clone()).await?;
    let record = &first.block("events").unwrap()[0];
    assert_eq!(record.download_status, Some(DownloadStatus::Success));
    assert_eq!(record.text.as_deref(), Some("Main street closed from 1 May"));
    assert!(record.file_content.is_none());
    assert_eq!(http.calls_to(pdf_url), 1);

    let second = run_once(&toml, http.clone(), store).await?;
    assert_eq!(second.meta(KEY_DOWNLOAD_STATS).unwrap()["skipped"], json!(1));
    assert_eq!(http.calls_to(pdf_url), 1);
    Ok(())
}

#[tokio::test]
async fn failing_download_stops_after_three_attempts() -> Result<()> {
    let toml = format!("{NOTICES}\n[download]\nretry_delay_ms = 0\n");
    let pdf_url = "https://city.example.org/docs/1.pdf";
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);
    let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", LISTING).status(pdf_url, 503));

    let ctx = run_once(&toml, http.clone(), store).await?;

    assert_eq!(http.calls_to(pdf_url), 3);
    let record = &ctx.block("events").unwrap()[0];
    assert_eq!(record.download_status, Some(DownloadStatus::Failed));
    assert!(record.download_error.is_some());
    Ok(())
}

#[tokio::test]
async fn tls_failure_is_retried_without_verification() -> Result<()> {
    use sourcewatch::app::ports::HttpError;

    let toml = format!("{NOTICES}\n[download]\nretry_delay_ms = 0\n");
    let pdf_url = "https://city.example.org/docs/1.pdf";
    let http = Arc::new(
        FakeHttp::new()
            .page(SOURCE, "text/html", LISTING)
            .reply(pdf_url, Err(HttpError::Tls("self-signed certificate".into()))),
    );
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);

    run_once(&toml, http.clone(), store).await?;

    // Every attempt tries verified first, then once without verification.
    let verify_flags: Vec<bool> = http
        .calls()
        .into_iter()
        .filter(|(u, _)| u == pdf_url)
        .map(|(_, verify)| verify)
        .collect();
    assert_eq!(verify_flags, vec![true, false, true, false, true, false]);
    Ok(())
}

#[tokio::test]
async fn storage_links_resolve_at_most_once_per_input() -> Result<()> {
    let toml = NOTICES.replace(
        "url = \"href\"",
        "url = { attr = \"href\", transform_type = \"smart_url\" }",
    );
    let page = r#"<div>
        <a class="item" href="https://disk.yandex.ru/d/abc">Plan</a>
        <a class="item" href="https://disk.yandex.ru/d/abc">Plan copy</a>
        <a class="item" href="https://disk.yandex.ru/d/xyz">Budget</a>
    </div>"#;
    let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", page));
    let dir = tempdir()?;
    let store = Arc::new(SqliteStateStore::open_at_root(dir.path())?);
    let counting = CountingResolver::default();

    for _ in 0..2 {
        let urls = UrlResolver::offline().with_provider(
            StorageProvider::YandexDisk,
            Box::new(Cached::new(counting.clone(), store.clone())),
        );
        let deps = PipelineDeps::new(http.clone(), store.clone()).with_urls(Arc::new(urls));
        let ctx = PipelineRunner::new(config(&toml), deps)?.run().await?;
        assert!(ctx.block("events").unwrap().len() <= 2);
    }

    assert_eq!(counting.count(), 2);
    Ok(())
}

#[tokio::test]
async fn composition_is_stable_and_html_enrichment_adds_one_stage() -> Result<()> {
    let with_download = format!("{NOTICES}\n[download]\n");
    let with_html = format!("{NOTICES}\n[download]\nallow_html = true\n");
    let store = Arc::new(InMemoryStore::new());
    let build = |toml: &str| -> Result<Vec<&'static str>> {
        let deps = PipelineDeps::new(Arc::new(FakeHttp::new()), store.clone());
        Ok(PipelineRunner::new(config(toml), deps)?.stage_names())
    };

    let a = build(&with_download)?;
    assert_eq!(a, build(&with_download)?);
    let b = build(&with_html)?;
    assert_eq!(b.len(), a.len() + 1);
    assert_eq!(b, vec!["fetch", "extract", "download", "html_enrich", "persist"]);
    Ok(())
}

#[tokio::test]
async fn normalization_filter_order_matters() -> Result<()> {
    let base = r#"
        template_name = "roads"

        [source]
        type = "html"
        url = "https://city.example.org/notices/?page=1"

        [extract.events]
        selector = ".item"

        [extract.events.fields]
        title = { selector = ".t" }
        url = { selector = "a", attr = "href" }
        text = { selector = ".body" }
    "#;
    let page = r#"<ul>
        <li class="item"><span class="t">Notice</span><a href="/1">x</a><p class="body">nothing here</p></li>
        <li class="item"><span class="t">Notice</span><a href="/2">x</a><p class="body">Road closure</p></li>
        <li class="item"><span class="t">Other</span><a href="/3">x</a><p class="body">road works</p></li>
    </ul>"#;
    let unique_then_match = format!(
        "{base}\n[[normalize.rules]]\nfield = \"events\"\n[[normalize.rules.filters]]\nunique = \"title\"\n[[normalize.rules.filters]]\nfilter = \"road\"\n"
    );
    let match_then_unique = format!(
        "{base}\n[[normalize.rules]]\nfield = \"events\"\n[[normalize.rules.filters]]\nfilter = \"road\"\n[[normalize.rules.filters]]\nunique = \"title\"\n"
    );

    let urls_for = |toml: String| async move {
        let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", page));
        let deps = PipelineDeps::new(http, Arc::new(InMemoryStore::new()));
        let ctx = PipelineRunner::new(config(&toml), deps)?.run().await?;
        let urls: Vec<String> = ctx.block("events").unwrap().iter().map(|r| r.url.clone()).collect();
        Ok::<_, anyhow::Error>(urls)
    };

    assert_eq!(urls_for(unique_then_match).await?, vec!["/3"]);
    assert_eq!(urls_for(match_then_unique).await?, vec!["/2", "/3"]);
    Ok(())
}

#[tokio::test]
async fn non_success_fetch_aborts_the_run() -> Result<()> {
    let http = Arc::new(FakeHttp::new().status(SOURCE, 500));
    let deps = PipelineDeps::new(http, Arc::new(InMemoryStore::new()));
    let err = PipelineRunner::new(config(NOTICES), deps)?.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Fetch { .. }));
    assert!(!err.is_config());
    Ok(())
}

#[tokio::test]
async fn dry_run_returns_a_bounded_preview() -> Result<()> {
    let http = Arc::new(FakeHttp::new().page(SOURCE, "text/html", LISTING));
    let deps = PipelineDeps::new(http, Arc::new(InMemoryStore::new()));
    let summary = PipelineRunner::new(config(NOTICES), deps)?
        .run_with_options(RunOptions { dry_run: true })
        .await?;
    let preview = summary.preview.expect("dry run preview");
    assert!(preview.iter().any(|l| l.starts_with("events: 1 records")));
    assert_eq!(preview.len(), summary.context.len());
    Ok(())
}

#[tokio::test]
async fn saving_the_same_record_twice_keeps_one_event() -> Result<()> {
    let dir = tempdir()?;
    let store = SqliteStateStore::open_at_root(dir.path())?;
    let mut record = Record::new("https://city.example.org/docs/1.pdf");
    record.title = Some("Road closure".to_string());

    assert!(store.save(&record, "city-notices").await?);
    assert!(!store.save(&record, "city-notices").await?);
    assert_eq!(store.count().await?, 1);
    assert!(store.exists_by_url("https://city.example.org/docs/1.pdf").await?);
    assert!(store.exists_by_fingerprint(&record).await?);
    Ok(())
}

#[test]
fn fingerprint_ignores_everything_but_url_and_title_prefix() {
    let prefix = "t".repeat(100);
    let mut a = Record::new("https://City.Example.org/a");
    a.title = Some(format!("{prefix} first tail"));
    a.text = Some("one".into());
    let mut b = Record::new("https://city.example.org/a");
    b.title = Some(format!("{} second tail", prefix.to_uppercase()));
    b.excerpt = Some("two".into());

    assert_eq!(record_fingerprint(&a), record_fingerprint(&b));

    b.url = "https://city.example.org/b".into();
    assert_ne!(record_fingerprint(&a), record_fingerprint(&b));
}
