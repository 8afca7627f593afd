//! Cart state: lines keyed by item + customizations, a version counter, and
//! the snapshot projection broadcast to clients.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::CartError;
use crate::ids::{ItemId, OptionId, SessionId};
use crate::money::Money;

const OPTIONS_SEPARATOR: char = '#';
const OPTION_LIST_SEPARATOR: char = ',';

/// Identity of a cart line: the item plus its sorted, de-duplicated options.
///
/// Text form is `burger` or `burger#bacon,cheese`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct LineKey {
    item_id: ItemId,
    options: Vec<OptionId>,
}

impl LineKey {
    pub fn new(item_id: ItemId, options: impl IntoIterator<Item = OptionId>) -> Self {
        let mut options: Vec<OptionId> = options.into_iter().collect();
        options.sort();
        options.dedup();
        Self { item_id, options }
    }

    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    pub fn options(&self) -> &[OptionId] {
        &self.options
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.item_id.as_str())?;
        if !self.options.is_empty() {
            let joined = self
                .options
                .iter()
                .map(OptionId::as_str)
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "{OPTIONS_SEPARATOR}{joined}")?;
        }
        Ok(())
    }
}

impl FromStr for LineKey {
    type Err = CartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (item, options) = match s.split_once(OPTIONS_SEPARATOR) {
            Some((item, rest)) => (item, Some(rest)),
            None => (s, None),
        };

        let item_id = ItemId::from_raw(item);
        if !item_id.is_well_formed() {
            return Err(CartError::MalformedRequest(format!("invalid line key: {s:?}")));
        }

        let mut option_ids = Vec::new();
        if let Some(rest) = options {
            for raw in rest.split(OPTION_LIST_SEPARATOR) {
                let option = OptionId::from_raw(raw);
                if !option.is_well_formed() {
                    return Err(CartError::MalformedRequest(format!(
                        "invalid line key: {s:?}"
                    )));
                }
                option_ids.push(option);
            }
        }

        Ok(Self::new(item_id, option_ids))
    }
}

impl Serialize for LineKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LineKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A customization chosen for a line, priced when it was added.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedOption {
    pub id: OptionId,
    pub name: String,
    pub price_delta: Money,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub key: LineKey,
    pub item_id: ItemId,
    pub name: String,
    pub unit_price: Money,
    pub customizations: Vec<SelectedOption>,
    pub quantity: u32,
    pub line_total: Money,
}

impl CartLine {
    /// Unit price plus every option delta.
    pub fn each_price(&self) -> Option<Money> {
        self.customizations
            .iter()
            .try_fold(self.unit_price, |acc, opt| acc.checked_add(opt.price_delta))
    }

    /// Recompute `line_total` from the current quantity.
    pub fn recompute(&mut self) -> Result<(), CartError> {
        self.line_total = self
            .each_price()
            .and_then(|each| each.checked_mul(self.quantity))
            .ok_or_else(|| CartError::Internal(format!("price overflow on line {}", self.key)))?;
        Ok(())
    }
}

/// Server-authoritative cart of one ordering session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cart {
    session_id: SessionId,
    lines: Vec<CartLine>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            lines: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a cart from persisted state.
    pub fn restore(
        session_id: SessionId,
        version: u64,
        lines: Vec<CartLine>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            lines,
            version,
            created_at,
            updated_at,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn find(&self, key: &LineKey) -> Option<&CartLine> {
        self.lines.iter().find(|line| &line.key == key)
    }

    pub fn item_count(&self) -> u32 {
        self.lines
            .iter()
            .fold(0u32, |acc, line| acc.saturating_add(line.quantity))
    }

    pub fn subtotal(&self) -> Money {
        self.lines
            .iter()
            .fold(Money::ZERO, |acc, line| acc.saturating_add(line.line_total))
    }

    /// The next accepted state: new lines, version + 1.
    pub(crate) fn successor(&self, lines: Vec<CartLine>) -> Self {
        Self {
            session_id: self.session_id.clone(),
            lines,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    pub fn snapshot(&self) -> CartSnapshot {
        CartSnapshot {
            session_id: self.session_id.clone(),
            version: self.version,
            lines: self.lines.clone(),
            item_count: self.item_count(),
            subtotal: self.subtotal(),
            updated_at: self.updated_at,
        }
    }
}

/// Full replacement state sent to every client of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSnapshot {
    pub session_id: SessionId,
    pub version: u64,
    pub lines: Vec<CartLine>,
    pub item_count: u32,
    pub subtotal: Money,
    pub updated_at: DateTime<Utc>,
}
