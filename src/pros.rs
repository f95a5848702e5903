//! Pro directory
//!
//! Read-only access to the workers table, used for geo selection and to resolve
//! e-mail-only references to identifiers.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::store::{Query, RowStore, StoreError};
use crate::types::{Pro, ProRef, PRO_EMAIL_FIELDS, PRO_ID_FIELDS};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two `(lat, lng)` points.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lng1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lng2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Closest pro with known coordinates. Ties keep listing order.
pub fn nearest(pros: &[Pro], origin: (f64, f64)) -> Option<(&Pro, f64)> {
    pros.iter()
        .filter_map(|p| p.location.map(|loc| (p, haversine_km(origin, loc))))
        .fold(None, |best: Option<(&Pro, f64)>, (pro, d)| match best {
            Some((_, bd)) if bd <= d => best,
            _ => Some((pro, d)),
        })
}

pub struct ProDirectory {
    store: Arc<dyn RowStore>,
    table: String,
}

impl ProDirectory {
    pub fn new(store: Arc<dyn RowStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    /// Every pro row in listing order. A missing table reads as empty.
    pub async fn list(&self) -> Result<Vec<Pro>> {
        match self.store.select(&self.table, &Query::new()).await {
            Ok(rows) => Ok(rows.iter().map(Pro::from_row).collect()),
            Err(StoreError::MissingTable { .. }) => {
                warn!(table = %self.table, "pro directory table missing");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Active pros that can be referenced by id or e-mail.
    pub async fn list_active(&self) -> Result<Vec<Pro>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|p| p.is_active() && (p.id.is_some() || p.email.is_some()))
            .collect())
    }

    /// Directory row matching either half of `pro`, id first. Each candidate
    /// column is queried with an equality filter; e-mails compare as stored.
    pub async fn find(&self, pro: &ProRef) -> Result<Option<Pro>> {
        let halves = [(PRO_ID_FIELDS, &pro.id), (PRO_EMAIL_FIELDS, &pro.email)];
        for (columns, value) in halves {
            let Some(value) = value else {
                continue;
            };
            for column in columns {
                let query = Query::new().eq(*column, value.as_str()).limit(1);
                match self.store.select(&self.table, &query).await {
                    Ok(rows) => {
                        if let Some(row) = rows.first() {
                            return Ok(Some(Pro::from_row(row)));
                        }
                    }
                    Err(StoreError::MissingTable { .. }) => {
                        warn!(table = %self.table, "pro directory table missing");
                        return Ok(None);
                    }
                    Err(StoreError::MissingColumn { .. }) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(None)
    }

    /// Fill in whichever of id / e-mail `pro` lacks. Lookup errors leave it as is.
    pub async fn complete(&self, pro: ProRef) -> ProRef {
        if pro.id.is_some() && pro.email.is_some() {
            return pro;
        }
        match self.find(&pro).await {
            Ok(Some(found)) => ProRef {
                id: pro.id.or(found.id),
                email: pro.email.or(found.email),
            },
            Ok(None) => pro,
            Err(err) => {
                warn!(error = %err, "pro directory lookup failed");
                pro
            }
        }
    }
}
