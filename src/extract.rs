//! Alarm listing extraction.
//!
//! All knowledge of the portal's markup lives here, behind
//! [`EventExtractor::parse`]. A markup change upstream means changing this
//! module, never the poll loop.
//!
//! # AlertMobile listing
//!
//! The history page holds one `<table>` with a header row and a body in
//! which date separator rows precede the events of that day:
//!
//! ```text
//! Tijd      Aansluiting  Alrm  Groep  Sector  Omschrijving
//! 03/02/23                            ---
//! 08:37:20  E0123456     UIT   6      0       Uit
//! 08:37:20  E0123456     INF   6      0       UITGESCH. CHARLIE
//! ```
//!
//! `INF` rows carry the "who did it" text for the neighbouring event with
//! the same slot (connection, group, sector, time), either just before or
//! just after it. The page is newest first; [`AlertMobileExtractor`] returns
//! events **oldest first**, keeping page order between equal timestamps.

use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use scraper::{ElementRef, Html, Selector};

use crate::error::{truncate_detail, RelayError};
use crate::event::Event;

/// Parses a fetched page into alarm events.
pub trait EventExtractor {
    /// Returns the events on the page in chronological order, oldest first.
    ///
    /// Fails with [`RelayError::Parse`] when the structural anchors are
    /// missing; an empty result only ever means "no events listed".
    fn parse(&self, raw: &str) -> Result<Vec<Event>, RelayError>;
}

const COL_TIME: &str = "Tijd";
const COL_CONNECTION: &str = "Aansluiting";
const COL_CODE: &str = "Alrm";
const COL_GROUP: &str = "Groep";
const COL_SECTOR: &str = "Sector";
const COL_TEXT: &str = "Omschrijving";
const COL_INFO: &str = "Info";

const REQUIRED_COLUMNS: [&str; 5] = [COL_TIME, COL_CODE, COL_GROUP, COL_SECTOR, COL_TEXT];

const INFO_CODE: &str = "INF";
const DATE_SEPARATOR_SECTOR: &str = "---";

/// Extractor for the AlertMobile "historie" status page.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlertMobileExtractor;

impl EventExtractor for AlertMobileExtractor {
    fn parse(&self, raw: &str) -> Result<Vec<Event>, RelayError> {
        let rows = table_rows(raw)?;
        let timed = assign_dates(rows)?;
        let merged = merge_info_rows(timed)?;
        check_single_connection(&merged)?;
        Ok(into_events(merged))
    }
}

/// One body row as header name → trimmed cell text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
    fields: BTreeMap<String, String>,
}

impl Row {
    fn get(&self, column: &str) -> &str {
        self.fields.get(column).map_or("", String::as_str)
    }

    fn is_date_separator(&self) -> bool {
        self.get(COL_CONNECTION).is_empty()
            && self.get(COL_CODE).is_empty()
            && self.get(COL_GROUP).is_empty()
            && self.get(COL_TEXT).is_empty()
            && self.get(COL_SECTOR) == DATE_SEPARATOR_SECTOR
    }
}

/// A row with its date resolved.
#[derive(Debug, Clone)]
struct TimedRow {
    at: NaiveDateTime,
    row: Row,
    info: Option<String>,
}

impl TimedRow {
    fn same_slot(&self, other: &Self) -> bool {
        self.at == other.at
            && self.row.get(COL_CONNECTION) == other.row.get(COL_CONNECTION)
            && self.row.get(COL_GROUP) == other.row.get(COL_GROUP)
            && self.row.get(COL_SECTOR) == other.row.get(COL_SECTOR)
    }

    fn is_info(&self) -> bool {
        self.row.get(COL_CODE) == INFO_CODE
    }
}

fn selector(css: &'static str) -> Result<Selector, RelayError> {
    Selector::parse(css).map_err(|e| RelayError::Parse(format!("bad selector {css}: {e}")))
}

fn cell_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn table_rows(raw: &str) -> Result<Vec<Row>, RelayError> {
    let document = Html::parse_document(raw);
    let table_sel = selector("table")?;
    let header_sel = selector("thead th")?;
    let row_sel = selector("tbody > tr")?;
    let cell_sel = selector("td")?;

    let mut saw_table = false;
    for table in document.select(&table_sel) {
        saw_table = true;
        let headers: Vec<String> = table.select(&header_sel).map(cell_text).collect();
        if !REQUIRED_COLUMNS
            .iter()
            .all(|col| headers.iter().any(|h| h == col))
        {
            continue;
        }

        let mut rows = Vec::new();
        for tr in table.select(&row_sel) {
            let cells: Vec<String> = tr.select(&cell_sel).map(cell_text).collect();
            if cells.is_empty() {
                continue;
            }
            if cells.len() != headers.len() {
                return Err(RelayError::Parse(format!(
                    "row has {} cells for {} columns: {}",
                    cells.len(),
                    headers.len(),
                    truncate_detail(&cells.join(" | "))
                )));
            }
            let fields = headers.iter().cloned().zip(cells).collect();
            rows.push(Row { fields });
        }
        return Ok(rows);
    }

    if saw_table {
        Err(RelayError::Parse(format!(
            "no table with columns {}",
            REQUIRED_COLUMNS.join(", ")
        )))
    } else {
        Err(RelayError::Parse("page contains no table".to_string()))
    }
}

fn parse_date(text: &str) -> Result<NaiveDate, RelayError> {
    let fields: Vec<&str> = text.split('/').collect();
    if let [day, month, year] = fields.as_slice() {
        if let (Ok(day), Ok(month), Ok(year)) =
            (day.parse::<u32>(), month.parse::<u32>(), year.parse::<i32>())
        {
            if let Some(date) = NaiveDate::from_ymd_opt(2000 + year, month, day) {
                return Ok(date);
            }
        }
    }
    Err(RelayError::Parse(format!("invalid date separator {text:?}")))
}

fn assign_dates(rows: Vec<Row>) -> Result<Vec<TimedRow>, RelayError> {
    let mut date = None;
    let mut timed = Vec::with_capacity(rows.len());
    for row in rows {
        if row.is_date_separator() {
            date = Some(parse_date(row.get(COL_TIME))?);
            continue;
        }
        let Some(day) = date else {
            return Err(RelayError::Parse(format!(
                "event at {:?} precedes any date separator",
                row.get(COL_TIME)
            )));
        };
        let time = NaiveTime::parse_from_str(row.get(COL_TIME), "%H:%M:%S").map_err(|e| {
            RelayError::Parse(format!("invalid time {:?}: {e}", row.get(COL_TIME)))
        })?;
        timed.push(TimedRow {
            at: day.and_time(time),
            row,
            info: None,
        });
    }
    Ok(timed)
}

fn merge_info_rows(rows: Vec<TimedRow>) -> Result<Vec<TimedRow>, RelayError> {
    let mut merged: Vec<TimedRow> = Vec::with_capacity(rows.len());
    let mut pending: Option<TimedRow> = None;
    // Index of the last plain row that may still receive a trailing INF row.
    let mut open_row: Option<usize> = None;

    for row in rows {
        if row.is_info() {
            let text = row.row.get(COL_TEXT).to_string();
            match open_row {
                Some(idx) if merged[idx].same_slot(&row) => merged[idx].info = Some(text),
                _ => pending = Some(row),
            }
        } else if let Some(info) = pending.take() {
            if !row.same_slot(&info) {
                return Err(RelayError::Parse(format!(
                    "info row {:?} at {} has no matching event",
                    info.row.get(COL_TEXT),
                    info.at
                )));
            }
            merged.push(TimedRow {
                info: Some(info.row.get(COL_TEXT).to_string()),
                ..row
            });
            open_row = None;
        } else {
            merged.push(row);
            open_row = Some(merged.len() - 1);
        }
    }

    if let Some(info) = pending {
        log::debug!(
            "Ignoring trailing info row {:?} at {}",
            info.row.get(COL_TEXT),
            info.at
        );
    }
    Ok(merged)
}

fn check_single_connection(rows: &[TimedRow]) -> Result<(), RelayError> {
    let Some(first) = rows.first() else {
        return Ok(());
    };
    let connection = first.row.get(COL_CONNECTION);
    match rows.iter().find(|r| r.row.get(COL_CONNECTION) != connection) {
        Some(other) => Err(RelayError::Parse(format!(
            "listing mixes connections {connection:?} and {:?}",
            other.row.get(COL_CONNECTION)
        ))),
        None => Ok(()),
    }
}

fn describe(info: Option<&str>, text: &str) -> String {
    let info = info.unwrap_or("");
    if text.is_empty() {
        info.to_string()
    } else if info.is_empty() || info == ":" {
        text.to_string()
    } else {
        format!("{info} ({text})")
    }
}

fn into_events(rows: Vec<TimedRow>) -> Vec<Event> {
    let mut events: Vec<Event> = rows
        .into_iter()
        .map(|timed| {
            let description = describe(timed.info.as_deref(), timed.row.get(COL_TEXT));
            let mut raw_fields = timed.row.fields.clone();
            if let Some(info) = timed.info {
                raw_fields.insert(COL_INFO.to_string(), info);
            }
            Event::new(
                timed.at,
                timed.row.get(COL_CODE),
                timed.row.get(COL_GROUP),
                timed.row.get(COL_SECTOR),
                description,
                raw_fields,
            )
        })
        .collect();

    // Stable: equal timestamps keep page order.
    events.sort_by_key(Event::occurred_at);

    let mut copies: HashMap<String, usize> = HashMap::new();
    events
        .into_iter()
        .map(|event| {
            let seen = copies.entry(event.identity_key().to_string()).or_insert(0);
            let occurrence = *seen;
            *seen += 1;
            event.with_occurrence(occurrence)
        })
        .collect()
}
