//! Device models to harvest.

/// iPhone product codes, newest first
pub const IPHONE_CODES: &[&str] = &[
    "14,6", "14,5", "14,4", "14,3", "14,2", "13,4", "13,3", "13,2", "13,1", "12,8", "12,5", "12,3",
    "12,1", "11,8", "11,6", "11,4", "11,2", "10,6", "10,5", "10,4", "10,3", "10,2", "10,1", "9,4",
    "9,3", "9,2", "9,1", "8,4", "8,2", "8,1", "7,2", "7,1", "6,2", "6,1", "5,4", "5,3", "5,2",
    "5,1", "4,1", "3,3", "3,2", "3,1", "2,1",
];

/// iPad product codes, newest first
pub const IPAD_CODES: &[&str] = &[
    "16,6", "16,4", "16,2", "15,8", "15,6", "15,5", "15,4", "15,3", "14,11", "14,9", "14,6",
    "14,4", "14,2", "13,19", "13,17", "13,11", "13,10", "13,7", "13,5", "13,2", "12,2", "11,7",
    "11,4", "11,2", "8,12", "8,10", "8,8", "8,7", "8,4", "8,3", "7,12", "7,6", "7,4", "7,2",
    "6,12", "6,8", "6,4", "5,4", "5,2", "4,9", "4,8", "4,6", "4,5", "4,3", "4,2", "3,6", "3,5",
    "3,3", "3,2", "2,7", "2,6", "2,3", "2,2", "1,1",
];

/// Selected iPhone and iPad product codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSet {
    iphones: Vec<String>,
    ipads: Vec<String>,
    other: Option<String>,
}

impl ProductSet {
    /// Build the selection.
    ///
    /// `product` restricts the set to one model such as `iPhone9,1`. Without
    /// it, `product_skip` drops the oldest N codes of each family.
    pub fn new(product_skip: usize, product: Option<&str>) -> Self {
        if let Some(product) = product {
            return Self::single(product);
        }

        let keep = |codes: &[&str]| -> Vec<String> {
            let len = codes.len().saturating_sub(product_skip);
            codes[..len].iter().map(ToString::to_string).collect()
        };

        Self {
            iphones: keep(IPHONE_CODES),
            ipads: keep(IPAD_CODES),
            other: None,
        }
    }

    fn single(product: &str) -> Self {
        if let Some(code) = product.strip_prefix("iPhone") {
            Self {
                iphones: vec![code.to_string()],
                ipads: Vec::new(),
                other: None,
            }
        } else if let Some(code) = product.strip_prefix("iPad") {
            Self {
                iphones: Vec::new(),
                ipads: vec![code.to_string()],
                other: None,
            }
        } else {
            Self {
                iphones: Vec::new(),
                ipads: Vec::new(),
                other: Some(product.to_string()),
            }
        }
    }

    /// Model strings, iPhones first then iPads
    pub fn models(&self) -> Vec<String> {
        self.iphones
            .iter()
            .map(|code| format!("iPhone{code}"))
            .chain(self.ipads.iter().map(|code| format!("iPad{code}")))
            .chain(self.other.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.iphones.len() + self.ipads.len() + usize::from(self.other.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
