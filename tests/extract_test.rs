//! Extractor behaviour against captured portal pages.

use alarm_relay::{AlertMobileExtractor, Category, Event, EventExtractor, RelayError};
use chrono::{NaiveDate, NaiveDateTime};

const STATUS_1: &str = include_str!("fixtures/status_1.html");
const STATUS_2: &str = include_str!("fixtures/status_2.html");
const STATUS_EMPTY: &str = include_str!("fixtures/status_empty.html");
const LOGIN: &str = include_str!("fixtures/login.html");

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d)
        .and_then(|date| date.and_hms_opt(h, mi, s))
        .unwrap()
}

fn summary(events: &[Event]) -> Vec<(NaiveDateTime, &str, &str, &str)> {
    events
        .iter()
        .map(|e| (e.occurred_at(), e.code(), e.group(), e.description()))
        .collect()
}

#[test]
fn test_status_page_events_oldest_first() {
    let events = AlertMobileExtractor.parse(STATUS_1).unwrap();
    assert_eq!(
        summary(&events),
        vec![
            (at(2023, 2, 2, 8, 37, 11), "ALARM_OFF", "1", "UITGESCH. ALICE (Uit)"),
            (at(2023, 2, 2, 10, 12, 5), "24H", "", "AUTOTEST (Test)"),
            (at(2023, 2, 2, 19, 9, 48), "ALARM_ON", "5", "VOLL. ING BOB (In)"),
            (at(2023, 2, 3, 8, 37, 20), "ALARM_OFF", "6", "UITGESCH. CHARLIE (Uit)"),
            (at(2023, 2, 3, 10, 12, 5), "24H", "", "AUTOTEST (Test)"),
            (at(2023, 7, 11, 0, 17, 25), "OVERRIDE_ALARM_TIME", "", "11-07-23 Bewaking"),
            (
                at(2023, 7, 11, 0, 17, 25),
                "OVERRIDE_ALARM_TIME",
                "",
                "11-07-23 Afwijkende inschakeltijd 02:15"
            ),
            (at(2023, 7, 11, 0, 22, 3), "ALARM_OFF", "12", "UITGESCH. BEWAAK (Uit)"),
        ]
    );
    assert!(events.iter().all(|e| e.sector() == "0"));
    assert!(events
        .iter()
        .all(|e| e.raw_fields().get("Aansluiting").map(String::as_str) == Some("E0123456")));
}

#[test]
fn test_status_page_categories() {
    let events = AlertMobileExtractor.parse(STATUS_1).unwrap();
    let categories: Vec<Category> = events.iter().map(Event::category).collect();
    assert_eq!(
        categories,
        vec![
            Category::Info,
            Category::Test,
            Category::Info,
            Category::Info,
            Category::Test,
            Category::Info,
            Category::Info,
            Category::Info,
        ]
    );
}

#[test]
fn test_keys_are_stable_across_fetches() {
    let first = AlertMobileExtractor.parse(STATUS_1).unwrap();
    let second = AlertMobileExtractor.parse(STATUS_1).unwrap();
    let first_keys: Vec<&str> = first.iter().map(Event::identity_key).collect();
    let second_keys: Vec<&str> = second.iter().map(Event::identity_key).collect();
    assert_eq!(first_keys, second_keys);

    let mut unique = first_keys.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), first_keys.len());
}

#[test]
fn test_listing_table_found_after_other_tables() {
    let events = AlertMobileExtractor.parse(STATUS_2).unwrap();
    assert_eq!(
        summary(&events),
        vec![
            (at(2025, 1, 14, 8, 41, 1), "ALARM_OFF", "7", "UITGESCH. CHARLIE (08:40 Uit)"),
            (at(2025, 1, 14, 10, 10, 58), "24H", "", "AUTOTEST (10:10 Test)"),
            (at(2025, 1, 14, 11, 48, 50), "(log)", "", "Gebr.: Monteur"),
            (at(2025, 1, 14, 11, 48, 50), "(log)", "", "Gebr.: Monteur"),
            (at(2025, 1, 14, 12, 14, 20), "INB", "1034", "INBRAAK   GBM RAAM KANTOOR"),
            (at(2025, 1, 14, 18, 4, 33), "ALARM_ON", "5", "VOLL. ING CHARLIE (18:04 In)"),
        ]
    );
}

#[test]
fn test_duplicate_log_rows_stay_distinct() {
    let events = AlertMobileExtractor.parse(STATUS_2).unwrap();
    let logs: Vec<&Event> = events.iter().filter(|e| e.code() == "(log)").collect();
    assert_eq!(logs.len(), 2);
    assert_ne!(logs[0].identity_key(), logs[1].identity_key());
    assert_eq!(logs[0].category(), Category::Unknown);
}

#[test]
fn test_colon_info_is_dropped_from_description() {
    let events = AlertMobileExtractor.parse(STATUS_2).unwrap();
    let burglary = events.iter().find(|e| e.code() == "INB").unwrap();
    assert_eq!(burglary.category(), Category::Alarm);
    assert_eq!(burglary.raw_fields().get("Info").map(String::as_str), Some(":"));
}

#[test]
fn test_empty_listing() {
    let events = AlertMobileExtractor.parse(STATUS_EMPTY).unwrap();
    assert!(events.is_empty());
}

#[test]
fn test_login_page_is_a_parse_error() {
    let err = AlertMobileExtractor.parse(LOGIN).unwrap_err();
    assert!(matches!(err, RelayError::Parse(_)));
}

#[test]
fn test_truncated_row_is_a_parse_error() {
    let broken = STATUS_1.replacen(
        "<td>00:22:03</td><td>E0123456</td><td>UIT</td>",
        "<td>00:22:03</td><td>E0123456</td><td>UIT</td><td>extra</td>",
        1,
    );
    assert_ne!(broken, STATUS_1);
    assert!(matches!(
        AlertMobileExtractor.parse(&broken),
        Err(RelayError::Parse(_))
    ));
}
