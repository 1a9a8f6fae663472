use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use flatwatch_adapters::{Extraction, Extractor, ExtractorConfig};
use flatwatch_core::{Listing, Source, DESCRIPTION_MAX_CHARS};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(source: &str, name: &str) -> String {
    let path = workspace_root().join("fixtures").join(source).join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// 2026-10-19 12:00 Europe/Berlin
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
}

fn extractor() -> Extractor {
    Extractor::new(ExtractorConfig::default()).expect("extractor")
}

fn listings(outcomes: Vec<Result<Extraction, flatwatch_adapters::ExtractError>>) -> (Vec<Listing>, usize) {
    let mut found = Vec::new();
    let mut too_old = 0;
    for outcome in outcomes {
        match outcome.expect("card extracts") {
            Extraction::Listing(listing) => found.push(*listing),
            Extraction::TooOld { .. } => too_old += 1,
        }
    }
    (found, too_old)
}

#[test]
fn kleinanzeigen_result_page() {
    let outcomes = extractor().extract_result_set(
        Source::Kleinanzeigen,
        &fixture("kleinanzeigen", "search.html"),
        "https://www.kleinanzeigen.de/s-wohnung-mieten/darmstadt/c203l4888",
        now(),
    );
    assert_eq!(outcomes.len(), 4);
    let (found, too_old) = listings(outcomes);
    assert_eq!(too_old, 1);
    assert_eq!(found.len(), 3);

    let first = &found[0];
    assert_eq!(first.external_id, "2891734412");
    assert_eq!(first.title, "Helle 2-Zimmer-Wohnung mit Balkon");
    assert_eq!(first.price, Some(753));
    assert_eq!(first.size, Some(54));
    assert_eq!(first.rooms.as_deref(), Some("2.5"));
    assert_eq!(first.location.as_deref(), Some("64283 Darmstadt"));
    assert_eq!(
        first.url,
        "https://www.kleinanzeigen.de/s-anzeige/helle-2-zimmer-wohnung-mit-balkon/2891734412-203-4888"
    );
    // "Heute, 09:15" in Berlin summer time
    assert_eq!(
        first.date_posted,
        Some(Utc.with_ymd_and_hms(2026, 10, 19, 7, 15, 0).unwrap())
    );
    assert_eq!(first.date_found, now());

    let second = &found[1];
    assert_eq!(second.price, Some(1540));
    assert_eq!(second.size, Some(92));
    assert_eq!(second.rooms.as_deref(), Some("3"));
    assert_eq!(second.location.as_deref(), Some("64285 Darmstadt - Bessungen"));

    let on_request = &found[2];
    assert_eq!(on_request.title, "Nachmieter gesucht");
    assert_eq!(on_request.price, None);
    assert_eq!(on_request.size, None);
}

#[test]
fn kleinanzeigen_detail_page() {
    let extraction = extractor()
        .extract_document(
            Source::Kleinanzeigen,
            &fixture("kleinanzeigen", "detail.html"),
            "https://www.kleinanzeigen.de/s-anzeige/ruhige-3-zimmer-wohnung/2891800555-203-4289",
            now(),
        )
        .expect("detail extracts");
    let Extraction::Listing(listing) = extraction else {
        panic!("expected a fresh listing");
    };
    assert_eq!(listing.external_id, "2891800555");
    assert_eq!(listing.title, "Ruhige 3-Zimmer-Wohnung in Bessungen");
    assert_eq!(listing.price, Some(1120));
    assert_eq!(listing.size, Some(78));
    assert_eq!(listing.rooms.as_deref(), Some("3"));
    assert_eq!(listing.location.as_deref(), Some("64285 Darmstadt - Bessungen"));
    assert!(listing.description.starts_with("Wir suchen einen Nachmieter"));
    assert!(listing.description.chars().count() <= DESCRIPTION_MAX_CHARS);
    assert_eq!(
        listing.date_posted,
        Some(Utc.with_ymd_and_hms(2026, 10, 18, 22, 0, 0).unwrap())
    );
}

#[test]
fn immowelt_result_page() {
    let outcomes = extractor().extract_result_set(
        Source::Immowelt,
        &fixture("immowelt", "search.html"),
        "https://www.immowelt.de/classified-search?distributionTypes=Rent&locations=AD08DE6345",
        now(),
    );
    let (found, too_old) = listings(outcomes);
    assert_eq!(too_old, 0);
    assert_eq!(found.len(), 2);

    assert_eq!(found[0].external_id, "immowelt_2b8kq5a");
    assert_eq!(found[0].url, "https://www.immowelt.de/expose/2b8kq5a");
    assert_eq!(found[0].title, "Moderne 3-Zimmer-Wohnung in Sachsenhausen");
    assert_eq!(found[0].price, Some(1180));
    assert_eq!(found[0].size, Some(78));
    assert_eq!(found[0].rooms.as_deref(), Some("3"));
    assert_eq!(
        found[0].location.as_deref(),
        Some("Sachsenhausen, Frankfurt am Main (60594)")
    );
    assert!(found[0].date_posted.is_none());

    assert_eq!(found[1].url, "https://www.immowelt.de/expose/2b8kq6b");
    assert_eq!(found[1].price, Some(640));
    assert_eq!(found[1].rooms.as_deref(), Some("1"));
}

#[test]
fn immoscout_result_page() {
    let outcomes = extractor().extract_result_set(
        Source::Immoscout,
        &fixture("immoscout", "search.html"),
        "https://www.immobilienscout24.de/Suche/de/hessen/frankfurt-am-main/wohnung-mieten",
        now(),
    );
    let (found, _) = listings(outcomes);
    assert_eq!(found.len(), 2);

    assert_eq!(found[0].external_id, "immoscout_151234567");
    assert_eq!(found[0].url, "https://www.immobilienscout24.de/expose/151234567");
    assert_eq!(found[0].title, "Erstbezug: 2-Zimmer-Wohnung mit Einbauküche");
    assert_eq!(found[0].price, Some(1045));
    assert_eq!(found[0].size, Some(61));
    assert_eq!(found[0].rooms.as_deref(), Some("2"));
    assert_eq!(found[0].location.as_deref(), Some("Bockenheim, Frankfurt am Main"));

    assert_eq!(found[1].price, Some(3950));
    assert_eq!(found[1].rooms.as_deref(), Some("4.5"));
}

#[test]
fn identical_cards_share_a_content_hash() {
    let html = fixture("kleinanzeigen", "search.html");
    let url = "https://www.kleinanzeigen.de/s-wohnung-mieten/darmstadt/c203l4888";
    let (a, _) = listings(extractor().extract_result_set(Source::Kleinanzeigen, &html, url, now()));
    let later = now() + chrono::Duration::minutes(30);
    let (b, _) = listings(extractor().extract_result_set(Source::Kleinanzeigen, &html, url, later));
    let hashes = |l: &[Listing]| l.iter().map(|x| x.content_hash.clone()).collect::<Vec<_>>();
    assert_eq!(hashes(&a), hashes(&b));
}
