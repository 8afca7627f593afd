//! Cart mutations.
//!
//! Each operation stages the successor cart without touching the current one,
//! so a rejected mutation is a no-op by construction. Callers that need to
//! persist before committing use [`CartMachine::stage`]; everyone else uses
//! [`CartMachine::apply`].

use crate::cart::{Cart, CartLine, CartSnapshot, LineKey};
use crate::catalog::Selection;
use crate::errors::CartError;
use crate::events::Operation;
use crate::money::Money;

/// Upper bounds enforced on every cart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CartLimits {
    pub max_lines: usize,
    pub max_line_quantity: u32,
}

impl Default for CartLimits {
    fn default() -> Self {
        Self {
            max_lines: 100,
            max_line_quantity: 99,
        }
    }
}

/// A validated, catalog-resolved mutation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Add {
        selection: Selection,
        quantity: i64,
    },
    Update {
        line: LineKey,
        quantity: Option<i64>,
        /// New customizations, already resolved against the line's item.
        selection: Option<Selection>,
    },
    Remove {
        line: LineKey,
        /// Units to take off; the whole line when absent.
        quantity: Option<i64>,
    },
    Clear,
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Add { .. } => Operation::Add,
            Self::Update { .. } => Operation::Update,
            Self::Remove { .. } => Operation::Remove,
            Self::Clear => Operation::Clear,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CartMachine {
    limits: CartLimits,
}

impl CartMachine {
    pub fn new(limits: CartLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> CartLimits {
        self.limits
    }

    /// Apply `mutation` in place and return the new snapshot.
    pub fn apply(&self, cart: &mut Cart, mutation: Mutation) -> Result<CartSnapshot, CartError> {
        let next = self.stage(cart, mutation)?;
        *cart = next;
        Ok(cart.snapshot())
    }

    /// Compute the successor of `cart` under `mutation`. `cart` is untouched.
    pub fn stage(&self, cart: &Cart, mutation: Mutation) -> Result<Cart, CartError> {
        let lines = match mutation {
            Mutation::Add { selection, quantity } => self.add(cart, selection, quantity)?,
            Mutation::Update {
                line,
                quantity,
                selection,
            } => self.update(cart, &line, quantity, selection)?,
            Mutation::Remove { line, quantity } => self.remove(cart, &line, quantity)?,
            Mutation::Clear => Vec::new(),
        };

        lines
            .iter()
            .try_fold(Money::ZERO, |acc, l| acc.checked_add(l.line_total))
            .ok_or_else(|| CartError::Internal("cart subtotal overflow".into()))?;

        Ok(cart.successor(lines))
    }

    fn add(
        &self,
        cart: &Cart,
        selection: Selection,
        quantity: i64,
    ) -> Result<Vec<CartLine>, CartError> {
        self.check_quantity(quantity)?;
        let key = selection.key();
        let mut lines = cart.lines().to_vec();

        if let Some(existing) = lines.iter_mut().find(|l| l.key == key) {
            let merged = i64::from(existing.quantity) + quantity;
            existing.quantity = self.check_quantity(merged)?;
            existing.recompute()?;
            return Ok(lines);
        }

        if lines.len() >= self.limits.max_lines {
            return Err(CartError::CartFull {
                limit: self.limits.max_lines,
            });
        }
        lines.push(new_line(selection, self.check_quantity(quantity)?)?);
        Ok(lines)
    }

    fn update(
        &self,
        cart: &Cart,
        key: &LineKey,
        quantity: Option<i64>,
        selection: Option<Selection>,
    ) -> Result<Vec<CartLine>, CartError> {
        if quantity.is_none() && selection.is_none() {
            return Err(CartError::MalformedRequest(
                "update needs a quantity or customizations".into(),
            ));
        }

        let mut lines = cart.lines().to_vec();
        let idx = position(&lines, key)?;

        let target = quantity.unwrap_or(i64::from(lines[idx].quantity));
        if target < 0 {
            return Err(CartError::InvalidQuantity {
                requested: target,
                max: self.limits.max_line_quantity,
            });
        }
        if target == 0 {
            lines.remove(idx);
            return Ok(lines);
        }
        let target = self.check_quantity(target)?;

        let Some(selection) = selection else {
            lines[idx].quantity = target;
            lines[idx].recompute()?;
            return Ok(lines);
        };

        if selection.item_id != *key.item_id() {
            return Err(CartError::MalformedRequest(format!(
                "customizations for {} cannot apply to line {key}",
                selection.item_id
            )));
        }

        let new_key = selection.key();
        let collision = lines
            .iter()
            .position(|l| l.key == new_key)
            .filter(|&other| other != idx);

        match collision {
            Some(other) => {
                // Re-customizing onto an existing combination merges the two lines.
                let merged = i64::from(lines[other].quantity) + i64::from(target);
                lines[other].quantity = self.check_quantity(merged)?;
                lines[other].recompute()?;
                lines.remove(idx);
            }
            None => {
                lines[idx] = new_line(selection, target)?;
            }
        }
        Ok(lines)
    }

    fn remove(
        &self,
        cart: &Cart,
        key: &LineKey,
        quantity: Option<i64>,
    ) -> Result<Vec<CartLine>, CartError> {
        let mut lines = cart.lines().to_vec();
        let idx = position(&lines, key)?;

        match quantity {
            None => {
                lines.remove(idx);
            }
            Some(q) if q <= 0 => {
                return Err(CartError::InvalidQuantity {
                    requested: q,
                    max: self.limits.max_line_quantity,
                });
            }
            Some(q) if q >= i64::from(lines[idx].quantity) => {
                lines.remove(idx);
            }
            Some(q) => {
                // q < current quantity, which fits in u32
                lines[idx].quantity -= q as u32;
                lines[idx].recompute()?;
            }
        }
        Ok(lines)
    }

    fn check_quantity(&self, quantity: i64) -> Result<u32, CartError> {
        let max = self.limits.max_line_quantity;
        if quantity < 1 || quantity > i64::from(max) {
            return Err(CartError::InvalidQuantity {
                requested: quantity,
                max,
            });
        }
        Ok(quantity as u32)
    }
}

fn position(lines: &[CartLine], key: &LineKey) -> Result<usize, CartError> {
    lines
        .iter()
        .position(|l| &l.key == key)
        .ok_or_else(|| CartError::LineNotFound(key.to_string()))
}

fn new_line(selection: Selection, quantity: u32) -> Result<CartLine, CartError> {
    let key = selection.key();
    let mut line = CartLine {
        key,
        item_id: selection.item_id,
        name: selection.name,
        unit_price: selection.unit_price,
        customizations: selection.options,
        quantity,
        line_total: Money::ZERO,
    };
    line.recompute()?;
    Ok(line)
}
