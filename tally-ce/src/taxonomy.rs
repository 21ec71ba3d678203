//! Taxonomy Registry
//!
//! Static tree of financial categories transactions are classified into.
//! Built once from a constant table and never mutated.
//!
//! `map_slug_to_id` is total: model output is untrusted text, so unknown or
//! malformed slugs resolve to the "other operating expenses" node.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Accounting classification of a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingType {
    Revenue,
    Cogs,
    Opex,
    Liability,
    Clearing,
}

impl AccountingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Cogs => "cogs",
            Self::Opex => "opex",
            Self::Liability => "liability",
            Self::Clearing => "clearing",
        }
    }
}

/// A single taxonomy node
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CategoryNode {
    pub id: Uuid,
    pub slug: &'static str,
    pub name: &'static str,
    pub parent_id: Option<Uuid>,
    pub accounting_type: AccountingType,
    /// Participates in Profit & Loss reporting
    pub is_pnl: bool,
    /// Offered to the model as a candidate category
    pub include_in_prompt: bool,
}

/// Well-known slugs referenced by engine logic
pub mod slugs {
    pub const HAIR_SERVICES: &str = "hair_services";
    pub const REFUNDS_ALLOWANCES: &str = "refunds_allowances";
    pub const PAYMENT_PROCESSING_FEES: &str = "payment_processing_fees";
    pub const SALES_TAX_PAYABLE: &str = "sales_tax_payable";
    pub const PAYOUTS_CLEARING: &str = "payouts_clearing";
    pub const OTHER_EXPENSES: &str = "other_expenses";
}

/// Stable id of the fallback node
pub const OTHER_EXPENSES_ID: Uuid = Uuid::from_u128(0x7a11_0000_0000_4000_8000_0000_0000_0399);

/// Slugs models commonly emit for the fallback node
const FALLBACK_ALIASES: &[&str] = &["other_ops", "other_operating_expenses", "other", "misc", "uncategorized"];

use AccountingType::{Clearing, Cogs, Liability, Opex, Revenue};

/// (id suffix, slug, name, parent id suffix, type, is_pnl, include_in_prompt)
type NodeRow = (u128, &'static str, &'static str, Option<u128>, AccountingType, bool, bool);

#[rustfmt::skip]
const NODES: &[NodeRow] = &[
    // Roots
    (0x100, "revenue", "Revenue", None, Revenue, true, false),
    (0x200, "cost_of_goods_sold", "Cost of Goods Sold", None, Cogs, true, false),
    (0x300, "operating_expenses", "Operating Expenses", None, Opex, true, false),
    (0x400, "liabilities", "Liabilities", None, Liability, false, false),
    (0x500, "clearing", "Clearing Accounts", None, Clearing, false, false),
    // Revenue
    (0x101, "hair_services", "Hair Services", Some(0x100), Revenue, true, true),
    (0x102, "color_services", "Color Services", Some(0x100), Revenue, true, true),
    (0x103, "nail_services", "Nail Services", Some(0x100), Revenue, true, true),
    (0x104, "spa_services", "Spa & Skin Services", Some(0x100), Revenue, true, true),
    (0x105, "retail_product_sales", "Retail Product Sales", Some(0x100), Revenue, true, true),
    (0x106, "other_income", "Other Income", Some(0x100), Revenue, true, true),
    (0x107, "refunds_allowances", "Refunds & Allowances", Some(0x100), Revenue, true, true),
    // Cost of goods sold
    (0x201, "retail_product_cost", "Retail Product Cost", Some(0x200), Cogs, true, true),
    (0x202, "salon_supplies", "Salon & Backbar Supplies", Some(0x200), Cogs, true, true),
    (0x203, "contract_labor", "Contract Labor", Some(0x200), Cogs, true, true),
    // Operating expenses
    (0x301, "rent", "Rent & Lease", Some(0x300), Opex, true, true),
    (0x302, "utilities", "Utilities & Telecom", Some(0x300), Opex, true, true),
    (0x303, "payroll", "Payroll & Benefits", Some(0x300), Opex, true, true),
    (0x304, "payment_processing_fees", "Payment Processing Fees", Some(0x300), Opex, true, true),
    (0x305, "software_subscriptions", "Software & Subscriptions", Some(0x300), Opex, true, true),
    (0x306, "marketing", "Marketing & Advertising", Some(0x300), Opex, true, true),
    (0x307, "insurance", "Insurance", Some(0x300), Opex, true, true),
    (0x308, "professional_services", "Professional Services", Some(0x300), Opex, true, true),
    (0x309, "bank_fees", "Bank Fees", Some(0x300), Opex, true, true),
    (0x30a, "repairs_maintenance", "Repairs & Maintenance", Some(0x300), Opex, true, true),
    (0x30b, "travel", "Travel", Some(0x300), Opex, true, true),
    (0x30c, "meals", "Meals", Some(0x300), Opex, true, true),
    (0x30d, "education_training", "Education & Training", Some(0x300), Opex, true, true),
    (0x399, "other_expenses", "Other Operating Expenses", Some(0x300), Opex, true, true),
    // Balance sheet / non-P&L
    (0x401, "sales_tax_payable", "Sales Tax Payable", Some(0x400), Liability, false, true),
    (0x402, "loan_payments", "Loan Payments", Some(0x400), Liability, false, false),
    (0x501, "payouts_clearing", "Payouts Clearing", Some(0x500), Clearing, false, true),
    (0x502, "owner_transfers", "Owner Transfers", Some(0x500), Clearing, false, false),
];

fn node_id(suffix: u128) -> Uuid {
    Uuid::from_u128(0x7a11_0000_0000_4000_8000_0000_0000_0000 | suffix)
}

static STANDARD: Lazy<Taxonomy> = Lazy::new(Taxonomy::standard);

/// Process-wide standard taxonomy
pub fn taxonomy() -> &'static Taxonomy {
    &STANDARD
}

/// In-memory category registry
#[derive(Debug, Clone)]
pub struct Taxonomy {
    nodes: Vec<CategoryNode>,
    by_slug: HashMap<&'static str, usize>,
    by_id: HashMap<Uuid, usize>,
}

impl Taxonomy {
    /// Build the standard small-business taxonomy
    pub fn standard() -> Self {
        let nodes: Vec<CategoryNode> = NODES
            .iter()
            .map(|&(id, slug, name, parent, accounting_type, is_pnl, include_in_prompt)| CategoryNode {
                id: node_id(id),
                slug,
                name,
                parent_id: parent.map(node_id),
                accounting_type,
                is_pnl,
                include_in_prompt,
            })
            .collect();
        Self::from_nodes(nodes)
    }

    /// Build a registry from explicit nodes (first occurrence wins on duplicates)
    pub fn from_nodes(nodes: Vec<CategoryNode>) -> Self {
        let mut by_slug = HashMap::with_capacity(nodes.len());
        let mut by_id = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            by_slug.entry(node.slug).or_insert(idx);
            by_id.entry(node.id).or_insert(idx);
        }
        Self { nodes, by_slug, by_id }
    }

    /// Structural problems: duplicate slugs/ids and dangling parents
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.by_slug.len() != self.nodes.len() {
            problems.push("duplicate slug in taxonomy".to_string());
        }
        if self.by_id.len() != self.nodes.len() {
            problems.push("duplicate id in taxonomy".to_string());
        }
        for node in &self.nodes {
            if let Some(parent) = node.parent_id {
                if !self.by_id.contains_key(&parent) {
                    problems.push(format!("{} has unknown parent {}", node.slug, parent));
                }
            }
        }
        if !self.by_id.contains_key(&OTHER_EXPENSES_ID) {
            problems.push("fallback node missing".to_string());
        }
        problems
    }

    pub fn nodes(&self) -> &[CategoryNode] {
        &self.nodes
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<&CategoryNode> {
        self.by_slug.get(slug).map(|&idx| &self.nodes[idx])
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<&CategoryNode> {
        self.by_id.get(&id).map(|&idx| &self.nodes[idx])
    }

    /// Direct children of `parent_slug` in table order
    pub fn children_of(&self, parent_slug: &str) -> Vec<&CategoryNode> {
        let Some(parent) = self.get_by_slug(parent_slug) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|n| n.parent_id == Some(parent.id))
            .collect()
    }

    /// Nodes offered to the model
    pub fn prompt_categories(&self) -> Vec<&CategoryNode> {
        self.nodes.iter().filter(|n| n.include_in_prompt).collect()
    }

    /// The "other operating expenses" node
    pub fn fallback(&self) -> Option<&CategoryNode> {
        self.get_by_id(OTHER_EXPENSES_ID)
    }

    /// Resolve a (possibly untrusted) slug to a category id; never fails
    pub fn map_slug_to_id(&self, slug: &str) -> Uuid {
        self.resolve_slug(slug)
            .map(|n| n.id)
            .unwrap_or(OTHER_EXPENSES_ID)
    }

    /// Resolve a slug after normalizing case, whitespace and separators
    pub fn resolve_slug(&self, slug: &str) -> Option<&CategoryNode> {
        let cleaned: String = slug
            .trim()
            .trim_matches(|c| c == '"' || c == '\'' || c == '`')
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        if let Some(node) = self.get_by_slug(&cleaned) {
            return Some(node);
        }
        if FALLBACK_ALIASES.contains(&cleaned.as_str()) {
            return self.fallback();
        }
        None
    }

    /// Accounting type for a slug, if known
    pub fn accounting_type_of(&self, slug: &str) -> Option<AccountingType> {
        self.get_by_slug(slug).map(|n| n.accounting_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_taxonomy_is_well_formed() {
        let tax = Taxonomy::standard();
        assert!(tax.validate().is_empty(), "{:?}", tax.validate());
        assert_eq!(tax.nodes().len(), NODES.len());
    }

    #[test]
    fn test_lookup_by_slug_and_id_agree() {
        let tax = taxonomy();
        let hair = tax.get_by_slug(slugs::HAIR_SERVICES).unwrap();
        assert_eq!(tax.get_by_id(hair.id).unwrap().slug, "hair_services");
        assert_eq!(hair.accounting_type, AccountingType::Revenue);
        assert_eq!(tax.get_by_slug("revenue").map(|n| n.id), hair.parent_id);
    }

    #[test]
    fn test_well_known_slugs_exist() {
        let tax = taxonomy();
        for slug in [
            slugs::HAIR_SERVICES,
            slugs::REFUNDS_ALLOWANCES,
            slugs::PAYMENT_PROCESSING_FEES,
            slugs::SALES_TAX_PAYABLE,
            slugs::PAYOUTS_CLEARING,
            slugs::OTHER_EXPENSES,
        ] {
            assert!(tax.get_by_slug(slug).is_some(), "missing {}", slug);
        }
        assert!(!tax.get_by_slug(slugs::SALES_TAX_PAYABLE).unwrap().is_pnl);
        assert_eq!(tax.fallback().unwrap().slug, slugs::OTHER_EXPENSES);
    }

    #[test]
    fn test_map_slug_to_id_is_total() {
        let tax = taxonomy();
        for input in ["", "   ", "not_a_category", "\u{0}", "{\"x\":1}", "hair services!!", "🙂"] {
            let id = tax.map_slug_to_id(input);
            assert_eq!(id, OTHER_EXPENSES_ID, "input {:?}", input);
            assert!(!id.is_nil());
        }
    }

    #[test]
    fn test_map_slug_to_id_normalizes_input() {
        let tax = taxonomy();
        let rent = tax.get_by_slug("rent").unwrap().id;
        assert_eq!(tax.map_slug_to_id("  RENT "), rent);
        assert_eq!(tax.map_slug_to_id("\"rent\""), rent);
        let fees = tax.get_by_slug("payment_processing_fees").unwrap().id;
        assert_eq!(tax.map_slug_to_id("Payment-Processing Fees"), fees);
        assert_eq!(tax.map_slug_to_id("other_ops"), OTHER_EXPENSES_ID);
    }

    #[test]
    fn test_children_of() {
        let tax = taxonomy();
        let revenue_children: Vec<_> = tax.children_of("revenue").iter().map(|n| n.slug).collect();
        assert!(revenue_children.contains(&"hair_services"));
        assert!(revenue_children.contains(&"refunds_allowances"));
        assert!(!revenue_children.contains(&"rent"));
        assert!(tax.children_of("nope").is_empty());
        assert!(tax.children_of("hair_services").is_empty());
    }

    #[test]
    fn test_prompt_categories_exclude_roots() {
        let tax = taxonomy();
        let prompt = tax.prompt_categories();
        assert!(prompt.iter().all(|n| n.include_in_prompt));
        assert!(prompt.iter().all(|n| n.parent_id.is_some()));
        assert!(!prompt.iter().any(|n| n.slug == "owner_transfers"));
    }

    #[test]
    fn test_validate_detects_dangling_parent() {
        let mut nodes = Taxonomy::standard().nodes().to_vec();
        nodes.push(CategoryNode {
            id: Uuid::from_u128(42),
            slug: "orphan",
            name: "Orphan",
            parent_id: Some(Uuid::from_u128(43)),
            accounting_type: AccountingType::Opex,
            is_pnl: true,
            include_in_prompt: false,
        });
        let tax = Taxonomy::from_nodes(nodes);
        assert_eq!(tax.validate().len(), 1);
    }
}
