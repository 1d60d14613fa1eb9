//! Wire format of the upstream streaming feed.
//!
//! Every frame is a JSON object tagged by `kind` with its payload under `v`:
//!
//! ```text
//! {"kind":"book","v":[{"m":1,"b":[{"b":true,"p":100,"a":2},{"b":false,"p":101,"a":3}]}]}
//! {"kind":"bookdelta","v":[{"m":1,"b":true,"p":100,"a":0}]}
//! {"kind":"subscribe","v":1}
//! ```
//!
//! In level entries `b` is the bid flag, `p` the price and `a` the size.
//! Per-market books and level entries are kept as raw JSON until applied so
//! one bad entry does not sink the rest of its batch.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::MarketId;
use crate::store::{LevelUpdate, Side};

pub const KIND_BOOK: &str = "book";
pub const KIND_BOOK_DELTA: &str = "bookdelta";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame is not JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("frame has no string `kind` tag")]
    MissingKind,
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed level entry: {0}")]
    Entry(#[source] serde_json::Error),
    #[error("negative size {0} in level entry")]
    NegativeSize(Decimal),
}

/// Commands sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "v", rename_all = "lowercase")]
pub enum FeedCommand {
    Subscribe(MarketId),
    Unsubscribe(MarketId),
    /// Ask for a fresh snapshot of one market.
    Request(MarketId),
}

impl FeedCommand {
    pub fn market_id(&self) -> MarketId {
        match *self {
            FeedCommand::Subscribe(id) | FeedCommand::Unsubscribe(id) | FeedCommand::Request(id) => id,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Full book for one market inside a `book` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct BookPayload {
    #[serde(rename = "m")]
    pub market_id: MarketId,
    #[serde(rename = "b", default)]
    pub levels: Vec<Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Raw per-market books, each `{m, b}`.
    Book(Vec<Value>),
    /// Raw delta entries, each `{m, b, p, a}`.
    BookDelta(Vec<Value>),
    Other(String),
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    #[serde(rename = "b")]
    is_bid: bool,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "a")]
    amount: Decimal,
}

impl WireLevel {
    fn into_update(self) -> Result<LevelUpdate, WireError> {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(WireError::NegativeSize(self.amount));
        }
        Ok(LevelUpdate {
            side: Side::from_is_bid(self.is_bid),
            price: self.price,
            size: self.amount,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(rename = "m")]
    market_id: MarketId,
    #[serde(flatten)]
    level: WireLevel,
}

pub fn decode(text: &str) -> Result<Inbound, WireError> {
    let mut frame: Value = serde_json::from_str(text).map_err(WireError::NotJson)?;

    let kind = frame
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or(WireError::MissingKind)?
        .to_string();
    let payload = frame
        .get_mut("v")
        .map(Value::take)
        .unwrap_or(Value::Null);

    match kind.as_str() {
        KIND_BOOK => serde_json::from_value(payload)
            .map(Inbound::Book)
            .map_err(|source| WireError::Payload {
                kind: KIND_BOOK,
                source,
            }),
        KIND_BOOK_DELTA => serde_json::from_value(payload)
            .map(Inbound::BookDelta)
            .map_err(|source| WireError::Payload {
                kind: KIND_BOOK_DELTA,
                source,
            }),
        _ => Ok(Inbound::Other(kind)),
    }
}

/// Parse one `{m, b}` market book of a snapshot frame. Its levels stay raw.
pub fn parse_book(entry: &Value) -> Result<BookPayload, WireError> {
    BookPayload::deserialize(entry).map_err(WireError::Entry)
}

/// Parse one `{b, p, a}` entry of a snapshot.
pub fn parse_level(entry: &Value) -> Result<LevelUpdate, WireError> {
    WireLevel::deserialize(entry)
        .map_err(WireError::Entry)?
        .into_update()
}

/// Parse the market id of a delta entry, if it carries a usable one.
pub fn delta_market_id(entry: &Value) -> Option<MarketId> {
    entry.get("m").and_then(Value::as_u64)
}

/// Parse one `{m, b, p, a}` delta entry.
pub fn parse_delta(entry: &Value) -> Result<(MarketId, LevelUpdate), WireError> {
    let delta = WireDelta::deserialize(entry).map_err(WireError::Entry)?;
    Ok((delta.market_id, delta.level.into_update()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn commands_are_tagged_like_inbound_frames() {
        assert_eq!(
            FeedCommand::Subscribe(1).encode().unwrap(),
            r#"{"kind":"subscribe","v":1}"#
        );
        assert_eq!(
            FeedCommand::Unsubscribe(12).encode().unwrap(),
            r#"{"kind":"unsubscribe","v":12}"#
        );
        assert_eq!(
            FeedCommand::Request(3).encode().unwrap(),
            r#"{"kind":"request","v":3}"#
        );
        assert_eq!(FeedCommand::Request(3).market_id(), 3);
    }

    #[test]
    fn decodes_book_frame() {
        let frame = r#"{"kind":"book","v":[{"m":1,"b":[{"b":true,"p":100,"a":2},{"b":false,"p":101,"a":3}]}]}"#;
        let Inbound::Book(books) = decode(frame).unwrap() else {
            panic!("expected book frame");
        };

        assert_eq!(books.len(), 1);
        let book = parse_book(&books[0]).unwrap();
        assert_eq!(book.market_id, 1);
        let levels: Vec<_> = book.levels.iter().map(|l| parse_level(l).unwrap()).collect();
        assert_eq!(
            levels,
            vec![
                LevelUpdate {
                    side: Side::Bid,
                    price: dec!(100),
                    size: dec!(2)
                },
                LevelUpdate {
                    side: Side::Ask,
                    price: dec!(101),
                    size: dec!(3)
                },
            ]
        );
    }

    #[test]
    fn decodes_delta_frame_with_string_numbers() {
        let frame = r#"{"kind":"bookdelta","v":[{"m":1,"b":true,"p":"100.25","a":"0"}]}"#;
        let Inbound::BookDelta(entries) = decode(frame).unwrap() else {
            panic!("expected delta frame");
        };

        let (market_id, update) = parse_delta(&entries[0]).unwrap();
        assert_eq!(market_id, 1);
        assert_eq!(update.side, Side::Bid);
        assert_eq!(update.price, dec!(100.25));
        assert!(update.size.is_zero());
    }

    #[test]
    fn unknown_kinds_pass_through() {
        match decode(r#"{"kind":"hello","v":{"server":"x"}}"#).unwrap() {
            Inbound::Other(kind) => assert_eq!(kind, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_frames_without_kind() {
        assert!(matches!(decode(r#"{"v":[]}"#), Err(WireError::MissingKind)));
        assert!(matches!(decode("PONG"), Err(WireError::NotJson(_))));
        assert!(matches!(
            decode(r#"{"kind":"book","v":{"m":1}}"#),
            Err(WireError::Payload { kind: "book", .. })
        ));
    }

    #[test]
    fn malformed_entries_are_reported_individually() {
        assert!(matches!(
            parse_level(&json!({"b": true, "p": "abc", "a": 1})),
            Err(WireError::Entry(_))
        ));
        assert!(matches!(
            parse_level(&json!({"b": false, "p": 10, "a": -1})),
            Err(WireError::NegativeSize(_))
        ));
        assert!(matches!(
            parse_delta(&json!({"b": true, "p": 10, "a": 1})),
            Err(WireError::Entry(_))
        ));
        assert_eq!(delta_market_id(&json!({"m": 5, "p": "bad"})), Some(5));
    }

    #[test]
    fn bad_market_books_fail_alone() {
        let frame = r#"{"kind":"book","v":[{"m":-1,"b":[]},{"m":"x"},{"b":[]},{"m":1,"b":[]}]}"#;
        let Inbound::Book(books) = decode(frame).unwrap() else {
            panic!("expected book frame");
        };

        assert_eq!(books.len(), 4);
        for bad in &books[..3] {
            assert!(matches!(parse_book(bad), Err(WireError::Entry(_))));
        }
        let good = parse_book(&books[3]).unwrap();
        assert_eq!(good.market_id, 1);
        assert!(good.levels.is_empty());
    }
}
