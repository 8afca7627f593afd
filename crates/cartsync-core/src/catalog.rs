//! Menu catalog lookup.
//!
//! The catalog is owned by the menu side of the platform; the cart only needs
//! to resolve an item reference and its options into prices. Prices are
//! captured on the line when it is added or re-customized and are never
//! re-read for later broadcasts.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cart::{LineKey, SelectedOption};
use crate::errors::{CartError, CatalogError};
use crate::ids::{ItemId, OptionId};
use crate::money::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogOption {
    pub id: OptionId,
    pub name: String,
    #[serde(default)]
    pub price_delta: Money,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub id: ItemId,
    pub name: String,
    pub unit_price: Money,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub options: Vec<CatalogOption>,
}

fn default_available() -> bool {
    true
}

impl CatalogItem {
    pub fn option(&self, id: &OptionId) -> Option<&CatalogOption> {
        self.options.iter().find(|o| &o.id == id)
    }
}

/// An item with its chosen options, priced and ready to become a cart line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub item_id: ItemId,
    pub name: String,
    pub unit_price: Money,
    pub options: Vec<SelectedOption>,
}

impl Selection {
    pub fn key(&self) -> LineKey {
        LineKey::new(self.item_id.clone(), self.options.iter().map(|o| o.id.clone()))
    }
}

/// Validate `option_ids` against `item` and price them.
///
/// Duplicate option ids collapse to one; the result is sorted by option id so
/// it lines up with the line key.
pub fn resolve_selection(
    item: &CatalogItem,
    option_ids: &[OptionId],
) -> Result<Selection, CartError> {
    if !item.available {
        return Err(CartError::InvalidItem(item.id.to_string()));
    }

    let mut ids: Vec<&OptionId> = option_ids.iter().collect();
    ids.sort();
    ids.dedup();

    let mut options = Vec::with_capacity(ids.len());
    for id in ids {
        let opt = item
            .option(id)
            .ok_or_else(|| CartError::InvalidCustomization {
                item: item.id.to_string(),
                option: id.to_string(),
            })?;
        options.push(SelectedOption {
            id: opt.id.clone(),
            name: opt.name.clone(),
            price_delta: opt.price_delta,
        });
    }

    Ok(Selection {
        item_id: item.id.clone(),
        name: item.name.clone(),
        unit_price: item.unit_price,
        options,
    })
}

/// Source of item definitions and prices.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// `Ok(None)` when the item does not exist.
    async fn lookup(&self, item_id: &ItemId) -> Result<Option<CatalogItem>, CatalogError>;
}

/// Look up `item_id` and resolve `option_ids` in one step.
pub async fn resolve(
    catalog: &dyn Catalog,
    item_id: &ItemId,
    option_ids: &[OptionId],
) -> Result<Selection, CartError> {
    let item = catalog
        .lookup(item_id)
        .await
        .map_err(|e| CartError::Internal(e.to_string()))?
        .ok_or_else(|| CartError::InvalidItem(item_id.to_string()))?;
    resolve_selection(&item, option_ids)
}

/// On-disk menu format: `{"items": [...]}`.
#[derive(Debug, Deserialize)]
struct MenuFile {
    items: Vec<CatalogItem>,
}

/// Catalog held entirely in memory, typically loaded from a menu JSON file.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    items: HashMap<ItemId, CatalogItem>,
}

impl InMemoryCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(items: Vec<CatalogItem>) -> Result<Self, CatalogError> {
        let mut map = HashMap::with_capacity(items.len());
        for item in items {
            if !item.id.is_well_formed() {
                return Err(CatalogError::Invalid(format!("bad item id {:?}", item.id.as_str())));
            }
            if item.unit_price < Money::ZERO {
                return Err(CatalogError::Invalid(format!("negative price for {}", item.id)));
            }
            let mut seen = std::collections::HashSet::new();
            for opt in &item.options {
                if !opt.id.is_well_formed() {
                    return Err(CatalogError::Invalid(format!(
                        "bad option id {:?} on {}",
                        opt.id.as_str(),
                        item.id
                    )));
                }
                if !seen.insert(&opt.id) {
                    return Err(CatalogError::Invalid(format!(
                        "duplicate option {} on {}",
                        opt.id, item.id
                    )));
                }
            }
            if map.contains_key(&item.id) {
                return Err(CatalogError::Invalid(format!("duplicate item {}", item.id)));
            }
            map.insert(item.id.clone(), item);
        }
        Ok(Self { items: map })
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let menu: MenuFile = serde_json::from_str(json)?;
        Self::new(menu.items)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn lookup(&self, item_id: &ItemId) -> Result<Option<CatalogItem>, CatalogError> {
        Ok(self.items.get(item_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MENU: &str = r#"{
        "items": [
            {"id": "burger", "name": "Burger", "unitPrice": 900,
             "options": [
                {"id": "cheese", "name": "Cheese", "priceDelta": 100},
                {"id": "bacon", "name": "Bacon", "priceDelta": 150},
                {"id": "no-onion", "name": "No onion"}
             ]},
            {"id": "soup", "name": "Soup of the day", "unitPrice": 550, "available": false}
        ]
    }"#;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_json_str(MENU).unwrap()
    }

    #[tokio::test]
    async fn resolves_item_and_options() {
        let cat = catalog();
        let sel = resolve(
            &cat,
            &ItemId::from_raw("burger"),
            &[OptionId::from_raw("cheese"), OptionId::from_raw("bacon")],
        )
        .await
        .unwrap();
        assert_eq!(sel.unit_price, Money::from_minor(900));
        assert_eq!(sel.options.len(), 2);
        assert_eq!(sel.options[0].id.as_str(), "bacon");
        assert_eq!(sel.key().to_string(), "burger#bacon,cheese");
    }

    #[tokio::test]
    async fn missing_option_delta_defaults_to_zero() {
        let cat = catalog();
        let sel = resolve(&cat, &ItemId::from_raw("burger"), &[OptionId::from_raw("no-onion")])
            .await
            .unwrap();
        assert_eq!(sel.options[0].price_delta, Money::ZERO);
    }

    #[tokio::test]
    async fn unknown_item_is_invalid_item() {
        let err = resolve(&catalog(), &ItemId::from_raw("pizza"), &[])
            .await
            .unwrap_err();
        assert_eq!(err, CartError::InvalidItem("pizza".into()));
    }

    #[tokio::test]
    async fn unavailable_item_is_invalid_item() {
        let err = resolve(&catalog(), &ItemId::from_raw("soup"), &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ITEM");
    }

    #[tokio::test]
    async fn foreign_option_is_invalid_customization() {
        let err = resolve(&catalog(), &ItemId::from_raw("burger"), &[OptionId::from_raw("large")])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CartError::InvalidCustomization {
                item: "burger".into(),
                option: "large".into()
            }
        );
    }

    #[test]
    fn duplicate_items_are_rejected() {
        let json = r#"{"items": [
            {"id": "a", "name": "A", "unitPrice": 1},
            {"id": "a", "name": "A again", "unitPrice": 2}
        ]}"#;
        let err = InMemoryCatalog::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("duplicate item"));
    }

    #[test]
    fn reserved_characters_in_ids_are_rejected() {
        let json = r#"{"items": [{"id": "a#b", "name": "A", "unitPrice": 1}]}"#;
        assert!(matches!(
            InMemoryCatalog::from_json_str(json),
            Err(CatalogError::Invalid(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MENU.as_bytes()).unwrap();
        let cat = InMemoryCatalog::load(file.path()).unwrap();
        assert_eq!(cat.len(), 2);
    }
}
