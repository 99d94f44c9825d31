use std::collections::BTreeMap;
use std::net::IpAddr;

use maxminddb::geoip2;
use orion_error::StructError;

use lazy_config::ConnectorConfig;

use crate::error::{CoreReason, CoreResult};
use crate::record::{Record, Value};

use super::{Filter, FilterError};

// ---------------------------------------------------------------------------
// GeoIpFilter — city lookups against a MaxMind database
// ---------------------------------------------------------------------------

/// Resolves the IP address under `KeyToFilter` against a GeoIP2 City
/// database (`DataBase` path) and attaches the result as a `geoip` sub-map.
pub struct GeoIpFilter {
    key_to_filter: String,
    db: maxminddb::Reader<Vec<u8>>,
}

impl GeoIpFilter {
    pub fn new(config: &ConnectorConfig) -> CoreResult<Self> {
        let path = config.string_param("DataBase", "");
        let db = maxminddb::Reader::open_readfile(&path).map_err(|e| {
            StructError::from(CoreReason::FilterBuild)
                .with_detail(format!("open geoip database {path:?}: {e}"))
        })?;
        Ok(Self {
            key_to_filter: config.string_param("KeyToFilter", ""),
            db,
        })
    }
}

impl Filter for GeoIpFilter {
    fn handle(&self, record: &mut Record) -> Result<(), FilterError> {
        let Some(ip_str) = record.get(&self.key_to_filter).and_then(Value::as_str) else {
            return Err(FilterError::msg("bad data format, not a string"));
        };
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| FilterError::msg(format!("bad ip address {ip_str:?}")))?;
        let city: geoip2::City = self
            .db
            .lookup(ip)
            .map_err(|e| FilterError::msg(format!("geoip lookup: {e}")))?;

        let mut info: BTreeMap<String, Value> = BTreeMap::new();
        let en = |names: Option<BTreeMap<&str, &str>>| {
            names
                .and_then(|n| n.get("en").map(|s| s.to_string()))
                .unwrap_or_default()
        };
        info.insert("ip".into(), Value::Str(ip_str.to_string()));
        info.insert(
            "city_name".into(),
            Value::Str(en(city.city.and_then(|c| c.names))),
        );
        info.insert(
            "country_name".into(),
            Value::Str(en(city.country.and_then(|c| c.names))),
        );
        info.insert(
            "country_code2".into(),
            Value::Str(
                city.represented_country
                    .and_then(|c| c.iso_code)
                    .unwrap_or_default()
                    .to_string(),
            ),
        );
        info.insert(
            "country_code3".into(),
            Value::Str(
                city.registered_country
                    .and_then(|c| c.iso_code)
                    .unwrap_or_default()
                    .to_string(),
            ),
        );
        info.insert(
            "continent_code".into(),
            Value::Str(
                city.continent
                    .and_then(|c| c.code)
                    .unwrap_or_default()
                    .to_string(),
            ),
        );
        if let Some(location) = city.location {
            info.insert(
                "timezone".into(),
                Value::Str(location.time_zone.unwrap_or_default().to_string()),
            );
            let lat = location.latitude.unwrap_or_default();
            let lon = location.longitude.unwrap_or_default();
            info.insert("latitude".into(), Value::Float(lat));
            info.insert("longitude".into(), Value::Float(lon));
            let mut point = BTreeMap::new();
            point.insert("lat".to_string(), Value::Float(lat));
            point.insert("lon".to_string(), Value::Float(lon));
            info.insert("location".into(), Value::Map(point));
        }

        record.insert("geoip", Value::Map(info));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
