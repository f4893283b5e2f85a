mod util;

use mediamend::executor::CancelFlag;
use mediamend::pipeline::{convert_run, reorganize_run, restore_run, RunMode, RunOptions};
use mediamend::store::{ContentStore, SiteSettings, StatusFilter};

fn apply_opts() -> RunOptions {
    RunOptions {
        mode: RunMode::Apply,
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn reorganize_then_restore_reconstructs_files_and_references() {
    let fx = util::fixture();
    let images = fx.images_root();
    util::write_png(&images.join("2024/hero.png"));
    util::write_png(&images.join("2024/body.png"));

    let original_html = concat!(
        "<img src=\"https://blog.example.com/content/images/size/w600/2024/hero.png\">",
        "<img src=\"/content/images/2024/body.png\">",
    );
    let mut store = fx.store(
        vec![util::item(
            "post-1",
            "alpha",
            original_html,
            Some("/content/images/2024/hero.png"),
        )],
        SiteSettings::default(),
    );

    let summary = reorganize_run(&fx.cfg, &mut store, &apply_opts(), &CancelFlag::new())
        .await
        .unwrap();
    let ledger_path = summary.ledger_path.expect("ledger written");
    assert!(!images.join("2024/hero.png").exists());

    let restore = restore_run(
        &fx.cfg,
        &mut store,
        &ledger_path,
        &apply_opts(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    assert!(images.join("2024/hero.png").is_file());
    assert!(images.join("2024/body.png").is_file());
    assert!(!images.join("alpha/alpha-1.png").exists());
    assert!(!images.join("alpha/alpha-2.png").exists());

    let items = store.list_items(StatusFilter::All).unwrap();
    assert_eq!(items[0].html, original_html, "body restores byte-identical");
    assert_eq!(
        items[0].feature_image.as_deref(),
        Some("/content/images/2024/hero.png")
    );
    assert_eq!(restore.warnings, 0);
}

#[tokio::test]
async fn convert_then_restore_reverts_references_and_keeps_both_files() {
    let fx = util::fixture();
    let images = fx.images_root();
    util::write_png(&images.join("2024/a.png"));

    let original_html = "<img src=\"/content/images/size/w300/2024/a.png\">";
    let mut store = fx.store(
        vec![util::item("post-1", "alpha", original_html, None)],
        SiteSettings::default(),
    );

    let summary = convert_run(&fx.cfg, &mut store, &apply_opts(), &CancelFlag::new())
        .await
        .unwrap();
    let ledger_path = summary.ledger_path.expect("ledger written");

    let items = store.list_items(StatusFilter::All).unwrap();
    assert!(items[0].html.contains("a.webp"));

    let restore = restore_run(
        &fx.cfg,
        &mut store,
        &ledger_path,
        &apply_opts(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    let items = store.list_items(StatusFilter::All).unwrap();
    assert_eq!(items[0].html, original_html);

    // Nothing physical to reverse: the convert never deleted the source.
    assert!(images.join("2024/a.png").is_file());
    assert!(images.join("2024/a.webp").is_file());
    assert_eq!(
        restore.transforms.reasons.get("original_retained"),
        Some(&1)
    );
}

#[tokio::test]
async fn missing_artifact_at_restore_time_is_a_warning_not_a_failure() {
    let fx = util::fixture();
    let images = fx.images_root();
    util::write_png(&images.join("2024/one.png"));
    util::write_png(&images.join("2024/two.png"));

    let html = concat!(
        "<img src=\"/content/images/2024/one.png\">",
        "<img src=\"/content/images/2024/two.png\">",
    );
    let mut store = fx.store(
        vec![util::item("post-1", "alpha", html, None)],
        SiteSettings::default(),
    );

    let summary = reorganize_run(&fx.cfg, &mut store, &apply_opts(), &CancelFlag::new())
        .await
        .unwrap();
    let ledger_path = summary.ledger_path.unwrap();

    // Someone deleted a relocated file out from under us.
    std::fs::remove_file(images.join("alpha/alpha-1.png")).unwrap();

    let restore = restore_run(
        &fx.cfg,
        &mut store,
        &ledger_path,
        &apply_opts(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    assert!(restore.warnings >= 1);
    assert_eq!(restore.transforms.errored, 1);
    // The surviving entry still restores.
    assert!(images.join("2024/two.png").is_file());
    let items = store.list_items(StatusFilter::All).unwrap();
    assert!(items[0].html.contains("/content/images/2024/two.png"));
}

#[tokio::test]
async fn restore_from_an_unreadable_ledger_is_fatal() {
    let fx = util::fixture();
    let mut store = fx.store(Vec::new(), SiteSettings::default());

    let bogus = fx.root.path().join("not-a-ledger.json");
    std::fs::write(&bogus, b"{broken").unwrap();

    let err = restore_run(
        &fx.cfg,
        &mut store,
        &bogus,
        &apply_opts(),
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "LEDGER/UNREADABLE");

    let missing = fx.root.path().join("absent.json");
    let err = restore_run(
        &fx.cfg,
        &mut store,
        &missing,
        &apply_opts(),
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "LEDGER/MISSING");
}
