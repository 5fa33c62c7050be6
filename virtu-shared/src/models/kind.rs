use serde::{Deserialize, Serialize};

/// The product kinds the platform can fulfill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductKind {
    TempNumber,
    Esim,
    SocialBoost,
    Voucher,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::TempNumber => "TEMP_NUMBER",
            ProductKind::Esim => "ESIM",
            ProductKind::SocialBoost => "SOCIAL_BOOST",
            ProductKind::Voucher => "VOUCHER",
        }
    }
}

impl std::str::FromStr for ProductKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEMP_NUMBER" => Ok(ProductKind::TempNumber),
            "ESIM" => Ok(ProductKind::Esim),
            "SOCIAL_BOOST" => Ok(ProductKind::SocialBoost),
            "VOUCHER" => Ok(ProductKind::Voucher),
            other => Err(format!("unknown product kind: {}", other)),
        }
    }
}

impl std::fmt::Display for ProductKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
