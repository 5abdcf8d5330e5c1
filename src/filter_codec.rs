// Mapping between a FilterSet and the flat key/value form used in the shareable location
// (URL query string), plus the canonical cache key of a SearchRequest.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::CatalogError;
use crate::models::{FilterSet, SearchRequest};

// Delimiter for set-valued fields ("make=Audi,BMW"). A delimiter or '%' inside a member is
// written as %2C / %25 so members round-trip unchanged.
pub const SET_DELIMITER: char = ',';

// Flat string-keyed representation. BTreeMap keeps key order stable.
pub type QueryParams = BTreeMap<String, String>;

// Recognized location keys
pub mod keys {
    pub const MAKE: &str = "make";
    pub const MODEL: &str = "model";
    pub const PRICE_MIN: &str = "priceMin";
    pub const PRICE_MAX: &str = "priceMax";
    pub const YEAR_MIN: &str = "yearMin";
    pub const YEAR_MAX: &str = "yearMax";
    pub const MILEAGE_MIN: &str = "mileageMin";
    pub const MILEAGE_MAX: &str = "mileageMax";
    pub const FUEL_TYPE: &str = "fuelType";
    pub const TRANSMISSION: &str = "transmission";
    pub const BODY_TYPE: &str = "bodyType";
    pub const LUXURY: &str = "luxury";
    pub const LOCATION: &str = "location";
}

/// Checks every `*Min <= *Max` pair where both sides are present, and that no free-text set
/// member is empty (an empty member has no encoding).
pub fn validate(filters: &FilterSet) -> Result<(), CatalogError> {
    check_range("price", filters.price_min, filters.price_max)?;
    check_range("year", filters.year_min, filters.year_max)?;
    check_range("mileage", filters.mileage_min, filters.mileage_max)?;
    check_members("make", &filters.make)?;
    check_members("model", &filters.model)?;
    Ok(())
}

fn check_members(
    field: &'static str,
    members: &std::collections::BTreeSet<String>,
) -> Result<(), CatalogError> {
    if members.iter().any(String::is_empty) {
        return Err(CatalogError::InvalidFilterValue {
            field,
            value: String::new(),
        });
    }
    Ok(())
}

fn check_range<T>(field: &'static str, min: Option<T>, max: Option<T>) -> Result<(), CatalogError>
where
    T: Into<i64> + Copy,
{
    if let (Some(min), Some(max)) = (min, max) {
        let (min, max) = (min.into(), max.into());
        if min > max {
            return Err(CatalogError::InvalidFilterRange { field, min, max });
        }
    }
    Ok(())
}

/// Encodes a FilterSet into query parameters.
///
/// Absent and default-valued fields produce no key. Fails with `InvalidFilterRange` when a
/// min/max pair is inverted; nothing is clamped.
pub fn encode(filters: &FilterSet) -> Result<QueryParams, CatalogError> {
    validate(filters)?;
    Ok(canonical_pairs(filters)
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect())
}

/// Unvalidated encoding in field order, shared by `encode`, the cache key and the upstream
/// query. Callers are expected to have validated the ranges already.
pub fn canonical_pairs(filters: &FilterSet) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();

    push_set(&mut pairs, keys::MAKE, filters.make.iter());
    push_set(&mut pairs, keys::MODEL, filters.model.iter());
    push_number(&mut pairs, keys::PRICE_MIN, filters.price_min);
    push_number(&mut pairs, keys::PRICE_MAX, filters.price_max);
    push_number(&mut pairs, keys::YEAR_MIN, filters.year_min);
    push_number(&mut pairs, keys::YEAR_MAX, filters.year_max);
    push_number(&mut pairs, keys::MILEAGE_MIN, filters.mileage_min);
    push_number(&mut pairs, keys::MILEAGE_MAX, filters.mileage_max);
    push_set(&mut pairs, keys::FUEL_TYPE, filters.fuel_type.iter());
    push_set(&mut pairs, keys::TRANSMISSION, filters.transmission.iter());
    push_set(&mut pairs, keys::BODY_TYPE, filters.body_type.iter());
    if filters.is_luxury {
        pairs.push((keys::LUXURY, "true".to_string()));
    }
    if let Some(city) = filters.location_city.as_deref().filter(|c| !c.is_empty()) {
        pairs.push((keys::LOCATION, city.to_string()));
    }

    pairs
}

fn push_set<'a, T, I>(pairs: &mut Vec<(&'static str, String)>, key: &'static str, values: I)
where
    T: Display + 'a,
    I: Iterator<Item = &'a T>,
{
    // Sorted by wire form so construction order never changes the output
    let mut values: Vec<String> = values
        .map(|v| escape_member(&v.to_string()))
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return;
    }
    values.sort();
    values.dedup();
    pairs.push((key, values.join(&SET_DELIMITER.to_string())));
}

fn push_number<T: Display>(pairs: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<T>) {
    if let Some(value) = value {
        pairs.push((key, value.to_string()));
    }
}

/// Decodes query parameters into a FilterSet. Never fails.
///
/// Unknown keys are ignored, a malformed number leaves its field absent, set values outside
/// their enum domain are dropped and empty set segments are discarded. When a key repeats the
/// last occurrence wins.
pub fn decode<K, V>(raw: impl IntoIterator<Item = (K, V)>) -> FilterSet
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut filters = FilterSet::default();

    for (key, value) in raw {
        let value = value.as_ref();
        match key.as_ref() {
            keys::MAKE => filters.make = split_strings(value),
            keys::MODEL => filters.model = split_strings(value),
            keys::PRICE_MIN => filters.price_min = parse_number(value),
            keys::PRICE_MAX => filters.price_max = parse_number(value),
            keys::YEAR_MIN => filters.year_min = parse_number(value),
            keys::YEAR_MAX => filters.year_max = parse_number(value),
            keys::MILEAGE_MIN => filters.mileage_min = parse_number(value),
            keys::MILEAGE_MAX => filters.mileage_max = parse_number(value),
            keys::FUEL_TYPE => filters.fuel_type = split_parsed(value),
            keys::TRANSMISSION => filters.transmission = split_parsed(value),
            keys::BODY_TYPE => filters.body_type = split_parsed(value),
            keys::LUXURY => filters.is_luxury = value == "true",
            keys::LOCATION => {
                filters.location_city = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            other => tracing::trace!(key = other, "Ignoring unknown filter key"),
        }
    }

    filters
}

fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    value.parse().ok()
}

fn escape_member(member: &str) -> String {
    member.replace('%', "%25").replace(SET_DELIMITER, "%2C")
}

// Single pass, so "%252C" comes back as the literal "%2C"
fn unescape_member(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let escape = rest.get(at..at + 3).unwrap_or("");
        if escape.eq_ignore_ascii_case("%2C") {
            out.push(SET_DELIMITER);
            rest = &rest[at + 3..];
        } else if escape == "%25" {
            out.push('%');
            rest = &rest[at + 3..];
        } else {
            out.push('%');
            rest = &rest[at + 1..];
        }
    }
    out.push_str(rest);
    out
}

fn segments(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(SET_DELIMITER)
        .filter(|s| !s.is_empty())
        .map(unescape_member)
}

fn split_strings(value: &str) -> std::collections::BTreeSet<String> {
    segments(value).collect()
}

fn split_parsed<T: FromStr + Ord>(value: &str) -> std::collections::BTreeSet<T> {
    segments(value).filter_map(|s| s.parse().ok()).collect()
}

// --- Location identifier (query string) ---

/// Parses "?make=BMW&priceMax=30000" (leading '?' optional) into query parameters.
pub fn parse_location(location: &str) -> QueryParams {
    let query = location.strip_prefix('?').unwrap_or(location);
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Formats query parameters as a query string without the leading '?'.
/// Delimiter commas are kept literal so shared links stay readable.
pub fn format_location(params: &QueryParams) -> String {
    params
        .iter()
        .map(|(key, value)| {
            let encoded: Vec<String> = value
                .split(SET_DELIMITER)
                .map(|part| url::form_urlencoded::byte_serialize(part.as_bytes()).collect())
                .collect();
            format!(
                "{}={}",
                url::form_urlencoded::byte_serialize(key.as_bytes()).collect::<String>(),
                encoded.join(&SET_DELIMITER.to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub fn encode_location(filters: &FilterSet) -> Result<String, CatalogError> {
    Ok(format_location(&encode(filters)?))
}

pub fn decode_location(location: &str) -> FilterSet {
    decode(parse_location(location))
}

/// Canonical cache key of a request: stable field order, sorted set values.
/// Logically identical requests map to the same key however they were built.
pub fn cache_key(request: &SearchRequest) -> String {
    let filters: QueryParams = canonical_pairs(&request.filters)
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    format!(
        "{}|page={}|pageSize={}|sort={}",
        format_location(&filters),
        request.page,
        request.page_size,
        request.sort
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BodyType, FuelType, SortDirection, SortField, SortOrder, Transmission};

    #[test]
    fn encodes_scenario_filters() {
        let filters = FilterSet::default()
            .with_make("BMW")
            .with_price(None, Some(30000));
        assert_eq!(encode_location(&filters).unwrap(), "make=BMW&priceMax=30000");
        assert_eq!(decode_location("make=BMW&priceMax=30000"), filters);
        assert_eq!(decode_location("?make=BMW&priceMax=30000"), filters);
    }

    #[test]
    fn omits_absent_and_default_fields() {
        let params = encode(&FilterSet::default()).unwrap();
        assert!(params.is_empty());

        let filters = FilterSet {
            is_luxury: false,
            location_city: Some(String::new()),
            ..FilterSet::default()
        };
        assert!(encode(&filters).unwrap().is_empty());
    }

    #[test]
    fn booleans_are_literal_true() {
        let params = encode(&FilterSet::default().luxury_only()).unwrap();
        assert_eq!(params.get("luxury").map(String::as_str), Some("true"));

        assert!(!decode([("luxury", "1")]).is_luxury);
        assert!(decode([("luxury", "true")]).is_luxury);
    }

    #[test]
    fn rejects_inverted_ranges() {
        let filters = FilterSet::default().with_price(Some(20000), Some(10000));
        assert_eq!(
            encode(&filters),
            Err(CatalogError::InvalidFilterRange {
                field: "price",
                min: 20000,
                max: 10000
            })
        );

        let years = FilterSet::default().with_year(Some(2022), Some(2018));
        assert!(matches!(
            encode(&years),
            Err(CatalogError::InvalidFilterRange { field: "year", .. })
        ));

        // Equal bounds are fine
        let equal = FilterSet::default().with_mileage(Some(50000), Some(50000));
        assert!(encode(&equal).is_ok());
    }

    #[test]
    fn decode_is_defensive() {
        let filters = decode([
            ("priceMin", "abc"),
            ("priceMax", "-5"),
            ("yearMin", "2015"),
            ("fuelType", "diesel,,rocket,electric,"),
            ("make", ",Audi,,BMW"),
            ("utm_source", "newsletter"),
        ]);

        assert_eq!(filters.price_min, None);
        assert_eq!(filters.price_max, None);
        assert_eq!(filters.year_min, Some(2015));
        assert_eq!(
            filters.fuel_type.into_iter().collect::<Vec<_>>(),
            vec![FuelType::Diesel, FuelType::Electric]
        );
        assert_eq!(
            filters.make.into_iter().collect::<Vec<_>>(),
            vec!["Audi".to_string(), "BMW".to_string()]
        );
    }

    #[test]
    fn set_values_join_sorted() {
        let filters = FilterSet::default()
            .with_make("Volkswagen")
            .with_make("Audi")
            .with_transmission(Transmission::Manual)
            .with_transmission(Transmission::Automatic)
            .with_body_type(BodyType::Suv);
        let params = encode(&filters).unwrap();
        assert_eq!(params["make"], "Audi,Volkswagen");
        assert_eq!(params["transmission"], "automatic,manual");
        assert_eq!(params["bodyType"], "suv");
        assert_eq!(decode(&params), filters);
    }

    #[test]
    fn location_escapes_values_but_keeps_delimiters() {
        let filters = FilterSet::default()
            .with_make("Mercedes-Benz")
            .with_make("Alfa Romeo")
            .with_location("Reggio Emilia");
        let location = encode_location(&filters).unwrap();
        assert_eq!(location, "location=Reggio+Emilia&make=Alfa+Romeo,Mercedes-Benz");
        assert_eq!(decode_location(&location), filters);
    }

    #[test]
    fn members_containing_the_delimiter_round_trip() {
        let filters = FilterSet::default()
            .with_model("Serie 3, Touring")
            .with_model("100%")
            .with_make("A%2CB");
        let params = encode(&filters).unwrap();
        assert_eq!(params["model"], "100%25,Serie 3%2C Touring");
        assert_eq!(decode(&params), filters);

        let location = encode_location(&filters).unwrap();
        assert_eq!(decode_location(&location), filters);
        assert_eq!(
            decode_location(&location).model.into_iter().collect::<Vec<_>>(),
            vec!["100%".to_string(), "Serie 3, Touring".to_string()]
        );
    }

    #[test]
    fn stray_percent_decodes_literally() {
        let filters = decode([("make", "50%off,%2c")]);
        assert_eq!(
            filters.make.into_iter().collect::<Vec<_>>(),
            vec![",".to_string(), "50%off".to_string()]
        );
    }

    #[test]
    fn empty_set_member_is_rejected() {
        let mut filters = FilterSet::default().with_make("BMW");
        filters.model.insert(String::new());
        assert_eq!(
            encode(&filters),
            Err(CatalogError::InvalidFilterValue {
                field: "model",
                value: String::new()
            })
        );
    }

    #[test]
    fn cache_key_ignores_construction_order() {
        let a = FilterSet::default()
            .with_make("BMW")
            .with_make("Audi")
            .with_fuel_type(FuelType::Hybrid)
            .with_fuel_type(FuelType::Diesel);
        let b = FilterSet::default()
            .with_fuel_type(FuelType::Diesel)
            .with_make("Audi")
            .with_fuel_type(FuelType::Hybrid)
            .with_make("BMW");
        let sort = SortOrder::default();

        let key_a = cache_key(&SearchRequest::new(a, 1, 20, sort));
        let key_b = cache_key(&SearchRequest::new(b.clone(), 1, 20, sort));
        assert_eq!(key_a, key_b);

        let other_page = cache_key(&SearchRequest::new(b.clone(), 2, 20, sort));
        assert_ne!(key_a, other_page);

        let other_sort = cache_key(&SearchRequest::new(
            b,
            1,
            20,
            SortOrder::new(SortField::Price, SortDirection::Asc),
        ));
        assert_ne!(key_a, other_sort);
        assert!(other_sort.ends_with("sort=price:asc"));
    }
}
