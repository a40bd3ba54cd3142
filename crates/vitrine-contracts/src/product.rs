use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub size: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub stock: u32,
}

/// Editable product fields, without the image list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFields {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price_cents: i64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
}

impl ProductFields {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("product name"));
        }
        if self.price_cents < 0 {
            return Err(ValidationError::NegativePrice);
        }
        if let Some(index) = self
            .variants
            .iter()
            .position(|variant| variant.size.trim().is_empty())
        {
            return Err(ValidationError::VariantMissingSize { index });
        }
        Ok(())
    }
}

/// A product row as persisted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(flatten)]
    pub fields: ProductFields,
    #[serde(default)]
    pub images: Vec<String>,
}
