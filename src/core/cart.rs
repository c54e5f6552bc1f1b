//! Purpose: Guest cart blob model and the mutation helpers writers use.
//! Exports: `LocalCart`, `CartItem`.
//! Role: Pure data layer under `store`; no I/O.
//! Invariants: `total_items` equals the sum of item quantities after every helper call.
//! Invariants: Product ids are unique within `items`; quantities are >= 1.
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCart {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub total_items: u64,
}

impl LocalCart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = CartItem>) -> Self {
        let mut cart = Self::new();
        for item in items {
            cart.add(item.product_id, item.quantity);
        }
        cart
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn quantity_of(&self, product_id: &str) -> u32 {
        self.items
            .iter()
            .find(|item| item.product_id == product_id)
            .map_or(0, |item| item.quantity)
    }

    /// Sum of item quantities, independent of the cached total.
    pub fn items_sum(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.total_items == self.items_sum()
    }

    pub fn add(&mut self, product_id: impl Into<String>, quantity: u32) {
        if quantity == 0 {
            return;
        }
        let product_id = product_id.into();
        match self
            .items
            .iter_mut()
            .find(|item| item.product_id == product_id)
        {
            Some(item) => item.quantity = item.quantity.saturating_add(quantity),
            None => self.items.push(CartItem {
                product_id,
                quantity,
            }),
        }
        self.recompute_total();
    }

    /// Sets an absolute quantity; zero removes the item.
    pub fn set_quantity(&mut self, product_id: impl Into<String>, quantity: u32) {
        let product_id = product_id.into();
        if quantity == 0 {
            self.remove(&product_id);
            return;
        }
        match self
            .items
            .iter_mut()
            .find(|item| item.product_id == product_id)
        {
            Some(item) => item.quantity = quantity,
            None => self.items.push(CartItem {
                product_id,
                quantity,
            }),
        }
        self.recompute_total();
    }

    pub fn remove(&mut self, product_id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.product_id != product_id);
        self.recompute_total();
        self.items.len() != before
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.total_items = 0;
    }

    /// Repairs blobs written by foreign writers: merges duplicate ids and drops zero quantities.
    pub(crate) fn normalize(&mut self) {
        let items = std::mem::take(&mut self.items);
        for item in items {
            self.add(item.product_id, item.quantity);
        }
        self.recompute_total();
    }

    fn recompute_total(&mut self) {
        self.total_items = self.items_sum();
    }
}
