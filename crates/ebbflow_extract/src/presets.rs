//! Built-in source definitions.

use crate::source::{
    CountProbe, RangeBound, RangeConfig, RequestTemplate, RowLayout, SourceDefinition,
};
use ebbflow_protocol::{ChunkSpan, KeyKind, Partition};
use ebbflow_sinks::{ColumnSpec, ColumnType};
use serde_json::json;
use std::collections::BTreeMap;

pub const OPEN_METEO: &str = "open_meteo";
pub const RICK_AND_MORTY: &str = "rick_and_morty";

const OPEN_METEO_URL: &str = "https://archive-api.open-meteo.com/v1/archive";
const RICK_AND_MORTY_URL: &str = "https://rickandmortyapi.com/api/{partition}";

const DAILY_VARIABLES: &[&str] = &[
    "temperature_2m_max",
    "temperature_2m_min",
    "temperature_2m_mean",
    "precipitation_sum",
    "windspeed_10m_max",
    "windgusts_10m_max",
    "sunshine_duration",
    "uv_index_max",
];

/// (city, latitude, longitude, timezone, country)
const CITIES: &[(&str, f64, f64, &str, &str)] = &[
    ("Sydney", -33.8688, 151.2093, "Australia/Sydney", "Australia"),
    ("Melbourne", -37.8136, 144.9631, "Australia/Melbourne", "Australia"),
    ("Brisbane", -27.4698, 153.0251, "Australia/Brisbane", "Australia"),
    ("Perth", -31.9505, 115.8605, "Australia/Perth", "Australia"),
    ("Adelaide", -34.9285, 138.6007, "Australia/Adelaide", "Australia"),
    ("Canberra", -35.2809, 149.1300, "Australia/Sydney", "Australia"),
    ("Hobart", -42.8821, 147.3272, "Australia/Hobart", "Australia"),
    ("Darwin", -12.4634, 130.8456, "Australia/Darwin", "Australia"),
    ("Cairns", -16.92366, 145.76613, "Australia/Brisbane", "Australia"),
    ("Alice Springs", -23.697479, 133.883621, "Australia/Darwin", "Australia"),
    ("Albany", -35.02692, 117.88369, "Australia/Perth", "Australia"),
    (
        "Palmerston North",
        -40.3563556918218,
        175.61113357543945,
        "Pacific/Auckland",
        "New Zealand",
    ),
    ("Wellington", -41.2865, 174.7762, "Pacific/Auckland", "New Zealand"),
    ("Auckland", -36.8485, 174.7633, "Pacific/Auckland", "New Zealand"),
    ("Christchurch", -43.5321, 172.6362, "Pacific/Auckland", "New Zealand"),
];

/// Names of every built-in source.
pub fn preset_names() -> &'static [&'static str] {
    &[OPEN_METEO, RICK_AND_MORTY]
}

pub fn preset(name: &str) -> Option<SourceDefinition> {
    match name {
        OPEN_METEO => Some(open_meteo()),
        RICK_AND_MORTY => Some(rick_and_morty()),
        _ => None,
    }
}

pub fn all_presets() -> Vec<SourceDefinition> {
    vec![open_meteo(), rick_and_morty()]
}

/// Daily weather per city from the Open-Meteo archive, 2021-01-01 through
/// two days ago (Sydney time), fetched one calendar year per request.
pub fn open_meteo() -> SourceDefinition {
    let partitions = CITIES
        .iter()
        .map(|(city, lat, lng, timezone, country)| {
            Partition::new(*city)
                .with_param("latitude", lat.to_string())
                .with_param("longitude", lng.to_string())
                .with_param("timezone", *timezone)
                .with_attribute("country", *country)
                .with_attribute("location", json!({"lat": lat, "lng": lng}))
        })
        .collect();

    let renames = [
        ("time", "date"),
        ("temperature_2m_max", "temperature_max"),
        ("temperature_2m_min", "temperature_min"),
        ("temperature_2m_mean", "temperature_mean"),
        ("windspeed_10m_max", "windspeed_max"),
        ("windgusts_10m_max", "windgusts_max"),
    ]
    .into_iter()
    .map(|(from, to)| (from.to_string(), to.to_string()))
    .collect();

    let columns = [
        "temperature_max",
        "temperature_min",
        "temperature_mean",
        "precipitation_sum",
        "windspeed_max",
        "windgusts_max",
        "sunshine_duration",
        "uv_index_max",
    ]
    .into_iter()
    .map(|name| ColumnSpec::new(name, ColumnType::Double))
    .chain([
        ColumnSpec::new("country", ColumnType::Varchar),
        ColumnSpec::new("location", ColumnType::Json),
    ])
    .collect();

    SourceDefinition {
        name: OPEN_METEO.to_string(),
        url: OPEN_METEO_URL.to_string(),
        query: BTreeMap::from([("daily".to_string(), DAILY_VARIABLES.join(","))]),
        key_kind: KeyKind::Date,
        key_field: "date".to_string(),
        partition_column: "City".to_string(),
        table: "daily_weather".to_string(),
        chunk_span: ChunkSpan::CalendarYear,
        layout: RowLayout::Columnar {
            pointer: "/daily".to_string(),
        },
        pagination: None,
        request: RequestTemplate::DateWindow {
            start_param: "start_date".to_string(),
            end_param: "end_date".to_string(),
        },
        renames,
        columns,
        partitions,
        range: Some(RangeConfig {
            start: RangeBound::literal("2021-01-01"),
            end: RangeBound::today(-2, "Australia/Sydney"),
        }),
        count_probe: None,
    }
}

/// Characters, episodes and locations from the Rick and Morty API. The total
/// count per resource bounds the id range; ids are fetched 20 per request.
pub fn rick_and_morty() -> SourceDefinition {
    SourceDefinition {
        name: RICK_AND_MORTY.to_string(),
        url: RICK_AND_MORTY_URL.to_string(),
        query: BTreeMap::new(),
        key_kind: KeyKind::Integer,
        key_field: "id".to_string(),
        partition_column: "resource".to_string(),
        table: "rick_and_morty".to_string(),
        chunk_span: ChunkSpan::Width(20),
        layout: RowLayout::Flat,
        pagination: None,
        request: RequestTemplate::IdList,
        renames: BTreeMap::new(),
        columns: vec![
            ColumnSpec::new("name", ColumnType::Varchar),
            ColumnSpec::new("url", ColumnType::Varchar),
            ColumnSpec::new("created", ColumnType::Timestamp),
        ],
        partitions: ["character", "episode", "location"]
            .into_iter()
            .map(Partition::new)
            .collect(),
        range: None,
        count_probe: Some(CountProbe {
            pointer: "/info/count".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for source in all_presets() {
            source.validate().unwrap();
        }
        assert!(preset("nope").is_none());
        assert_eq!(preset(OPEN_METEO).unwrap().partitions.len(), 15);
    }

    #[test]
    fn test_open_meteo_partition_shape() {
        let source = open_meteo();
        let wellington = source.partition("Wellington").unwrap();
        assert_eq!(wellington.params["timezone"], "Pacific/Auckland");
        assert_eq!(wellington.attributes["country"], json!("New Zealand"));
        assert_eq!(
            wellington.attributes["location"],
            json!({"lat": -41.2865, "lng": 174.7762})
        );
        assert_eq!(source.renames["time"], "date");
        assert!(source.query["daily"].starts_with("temperature_2m_max,"));
    }

    #[test]
    fn test_rick_and_morty_requests_by_resource() {
        let source = rick_and_morty();
        let request = source.base_request(source.partition("episode").unwrap());
        assert_eq!(request.url, "https://rickandmortyapi.com/api/episode");
    }
}
