use crate::error::{ForgeError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Fixed set of income statement concepts that row labels are matched against.
///
/// Declaration order is the classifier's tie-break priority: subtotals come before
/// the components they are built from.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum CanonicalLineItem {
    #[schemars(description = "Net income / net earnings attributable to the company")]
    NetIncome,

    #[schemars(description = "Income before income taxes")]
    PretaxIncome,

    #[schemars(description = "Operating income / operating profit / EBIT")]
    OperatingIncome,

    #[schemars(description = "Earnings before interest, taxes, depreciation and amortization")]
    Ebitda,

    #[schemars(description = "Revenue less cost of goods sold")]
    GrossProfit,

    #[schemars(description = "Total revenue / net sales (reported positive)")]
    Revenue,

    #[schemars(description = "Direct cost of revenue (expense)")]
    CostOfGoodsSold,

    #[schemars(description = "Selling, general, administrative and other operating expenses")]
    OperatingExpenses,

    #[schemars(description = "Interest expense net of interest income")]
    InterestExpense,

    #[schemars(description = "Income tax expense / provision for income taxes")]
    IncomeTaxExpense,
}

/// How the taxonomy expects an item's values to be signed once assembled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SignConvention {
    /// Reported and stored as a positive figure.
    Positive,
    /// An expense stored as a positive magnitude; sheets often report it negative.
    NegativeAsReported,
    /// A subtotal derived from other items; sign follows the arithmetic.
    ComputedSubtotal,
}

/// `item = Σ coefficient × component`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtotalFormula {
    pub item: CanonicalLineItem,
    pub terms: &'static [(f64, CanonicalLineItem)],
}

impl fmt::Display for SubtotalFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} =", self.item)?;
        for (idx, (coefficient, component)) in self.terms.iter().enumerate() {
            let op = if *coefficient < 0.0 { "-" } else { "+" };
            if idx == 0 && *coefficient >= 0.0 {
                write!(f, " {}", component)?;
            } else {
                write!(f, " {} {}", op, component)?;
            }
        }
        Ok(())
    }
}

use CanonicalLineItem::*;

const SUBTOTAL_FORMULAS: &[SubtotalFormula] = &[
    SubtotalFormula {
        item: GrossProfit,
        terms: &[(1.0, Revenue), (-1.0, CostOfGoodsSold)],
    },
    SubtotalFormula {
        item: OperatingIncome,
        terms: &[(1.0, GrossProfit), (-1.0, OperatingExpenses)],
    },
    SubtotalFormula {
        item: PretaxIncome,
        terms: &[(1.0, OperatingIncome), (-1.0, InterestExpense)],
    },
    SubtotalFormula {
        item: NetIncome,
        terms: &[(1.0, PretaxIncome), (-1.0, IncomeTaxExpense)],
    },
];

impl CanonicalLineItem {
    /// All items in priority order.
    pub const ALL: [CanonicalLineItem; 10] = [
        NetIncome,
        PretaxIncome,
        OperatingIncome,
        Ebitda,
        GrossProfit,
        Revenue,
        CostOfGoodsSold,
        OperatingExpenses,
        InterestExpense,
        IncomeTaxExpense,
    ];

    pub fn sign_convention(&self) -> SignConvention {
        match self {
            Revenue => SignConvention::Positive,
            CostOfGoodsSold | OperatingExpenses | InterestExpense | IncomeTaxExpense => {
                SignConvention::NegativeAsReported
            }
            GrossProfit | OperatingIncome | Ebitda | PretaxIncome | NetIncome => {
                SignConvention::ComputedSubtotal
            }
        }
    }

    pub fn is_subtotal(&self) -> bool {
        self.sign_convention() == SignConvention::ComputedSubtotal
    }

    /// Lower is preferred when two candidates score equally.
    pub fn priority(&self) -> usize {
        Self::ALL.iter().position(|i| i == self).unwrap_or(usize::MAX)
    }

    pub fn subtotal_formula(&self) -> Option<&'static SubtotalFormula> {
        SUBTOTAL_FORMULAS.iter().find(|f| f.item == *self)
    }

    /// Formulas in evaluation order: each one only depends on items resolved before it.
    pub fn subtotal_formulas() -> &'static [SubtotalFormula] {
        SUBTOTAL_FORMULAS
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            NetIncome => "Net Income",
            PretaxIncome => "Pretax Income",
            OperatingIncome => "Operating Income",
            Ebitda => "EBITDA",
            GrossProfit => "Gross Profit",
            Revenue => "Revenue",
            CostOfGoodsSold => "Cost of Goods Sold",
            OperatingExpenses => "Operating Expenses",
            InterestExpense => "Interest Expense",
            IncomeTaxExpense => "Income Tax Expense",
        }
    }
}

impl fmt::Display for CanonicalLineItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct AliasEntry {
    #[schemars(description = "Row label text; normalized (lowercase, no punctuation) before matching")]
    pub alias: String,

    #[schemars(description = "Canonical line item this label stands for")]
    pub item: CanonicalLineItem,

    #[serde(default = "default_confidence")]
    #[schemars(description = "Base confidence (0-1) scaling fuzzy matches against this alias")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// Data-driven mapping from label text to canonical items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct AliasTable {
    #[schemars(description = "Alias entries; the same alias may not map to two different items")]
    pub entries: Vec<AliasEntry>,
}

const BUILTIN_ALIASES: &[(&str, CanonicalLineItem, f64)] = &[
    ("revenue", Revenue, 1.0),
    ("revenues", Revenue, 1.0),
    ("total revenue", Revenue, 1.0),
    ("total revenues", Revenue, 1.0),
    ("net revenue", Revenue, 1.0),
    ("net revenues", Revenue, 1.0),
    ("sales", Revenue, 0.95),
    ("net sales", Revenue, 1.0),
    ("total net sales", Revenue, 1.0),
    ("cost of goods sold", CostOfGoodsSold, 1.0),
    ("cogs", CostOfGoodsSold, 1.0),
    ("cost of revenue", CostOfGoodsSold, 1.0),
    ("cost of revenues", CostOfGoodsSold, 1.0),
    ("cost of sales", CostOfGoodsSold, 1.0),
    ("cost of goods and services sold", CostOfGoodsSold, 1.0),
    ("gross profit", GrossProfit, 1.0),
    ("gross income", GrossProfit, 0.95),
    ("gross margin", GrossProfit, 0.9),
    ("operating expenses", OperatingExpenses, 1.0),
    ("total operating expenses", OperatingExpenses, 1.0),
    ("opex", OperatingExpenses, 1.0),
    ("selling general and administrative expenses", OperatingExpenses, 0.9),
    ("selling general and administrative", OperatingExpenses, 0.9),
    ("sg&a", OperatingExpenses, 0.9),
    ("operating income", OperatingIncome, 1.0),
    ("operating profit", OperatingIncome, 1.0),
    ("income from operations", OperatingIncome, 1.0),
    ("ebit", OperatingIncome, 0.95),
    ("ebitda", Ebitda, 1.0),
    ("interest expense", InterestExpense, 1.0),
    ("net interest expense", InterestExpense, 1.0),
    ("interest expense net", InterestExpense, 1.0),
    ("income before taxes", PretaxIncome, 1.0),
    ("income before income taxes", PretaxIncome, 1.0),
    ("pretax income", PretaxIncome, 1.0),
    ("pre tax income", PretaxIncome, 1.0),
    ("earnings before taxes", PretaxIncome, 1.0),
    ("ebt incl unusual items", PretaxIncome, 1.0),
    ("ebt", PretaxIncome, 0.95),
    ("income tax expense", IncomeTaxExpense, 1.0),
    ("income taxes", IncomeTaxExpense, 1.0),
    ("provision for income taxes", IncomeTaxExpense, 1.0),
    ("income tax", IncomeTaxExpense, 1.0),
    ("net income", NetIncome, 1.0),
    ("net income gaap", NetIncome, 1.0),
    ("net profit", NetIncome, 1.0),
    ("net earnings", NetIncome, 1.0),
    ("net income to company", NetIncome, 1.0),
];

impl Default for AliasTable {
    fn default() -> Self {
        Self {
            entries: BUILTIN_ALIASES
                .iter()
                .map(|(alias, item, confidence)| AliasEntry {
                    alias: alias.to_string(),
                    item: *item,
                    confidence: *confidence,
                })
                .collect(),
        }
    }
}

impl AliasTable {
    pub fn new(entries: Vec<AliasEntry>) -> Result<Self> {
        let table = Self { entries };
        table.validate()?;
        Ok(table)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let table: AliasTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Adds entries on top of this table; later entries replace earlier ones with
    /// the same normalized alias.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = AliasEntry>) -> Result<()> {
        for entry in entries {
            let key = crate::classifier::normalize_label(&entry.alias);
            self.entries
                .retain(|e| crate::classifier::normalize_label(&e.alias) != key);
            self.entries.push(entry);
        }
        self.validate()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(AliasTable);
        serde_json::to_string_pretty(&schema)
    }

    fn validate(&self) -> Result<()> {
        let mut seen: std::collections::HashMap<String, CanonicalLineItem> =
            std::collections::HashMap::new();

        for entry in &self.entries {
            if !(0.0..=1.0).contains(&entry.confidence) {
                return Err(ForgeError::InvalidAlias {
                    alias: entry.alias.clone(),
                    details: format!("confidence {} must be between 0.0 and 1.0", entry.confidence),
                });
            }

            let key = crate::classifier::normalize_label(&entry.alias);
            if key.is_empty() {
                return Err(ForgeError::InvalidAlias {
                    alias: entry.alias.clone(),
                    details: "alias is empty after normalization".to_string(),
                });
            }

            if let Some(existing) = seen.insert(key, entry.item) {
                if existing != entry.item {
                    return Err(ForgeError::InvalidAlias {
                        alias: entry.alias.clone(),
                        details: format!("already mapped to {}", existing),
                    });
                }
            }
        }
        Ok(())
    }
}
