//! Geographic fallback: borrow the prices of the nearest directly scraped
//! location when a target has none of its own.

use stromdb_core::{Coordinates, DataSource, PriceRecord, ReferenceData, Target};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Smallest distance recorded for a fallback, so a co-located donor still
/// satisfies `distance_km > 0`.
const MIN_FALLBACK_DISTANCE_KM: f64 = 0.01;

/// Great-circle distance in kilometres (haversine, mean Earth radius).
#[must_use]
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn resolve(
    own: Option<Coordinates>,
    location_id: &str,
    reference: &dyn ReferenceData,
) -> Option<Coordinates> {
    own.filter(Coordinates::is_valid)
        .or_else(|| reference.coordinates(location_id))
        .filter(Coordinates::is_valid)
}

/// Finds the nearest `ORIGINAL` record within `max_radius_km` of `target`
/// and returns a `FALLBACK` copy of it for the target.
///
/// Returns `None` when the target has no resolvable coordinates, no
/// candidate has coordinates, or the nearest candidate is out of range.
/// Among equally distant candidates the first in `available` wins.
#[must_use]
pub fn find_fallback(
    target: &Target,
    available: &[PriceRecord],
    reference: &dyn ReferenceData,
    max_radius_km: f64,
) -> Option<PriceRecord> {
    let Some(origin) = resolve(target.coordinates, &target.location_id, reference) else {
        tracing::debug!(location_id = %target.location_id, "no coordinates for fallback target");
        return None;
    };

    let mut nearest: Option<(&PriceRecord, f64)> = None;
    for candidate in available {
        if candidate.source != DataSource::Original
            || candidate.location_id == target.location_id
            || !candidate.has_prices()
        {
            continue;
        }
        let Some(position) = resolve(candidate.coordinates, &candidate.location_id, reference)
        else {
            continue;
        };
        let distance = haversine_km(origin, position);
        if nearest.is_none_or(|(_, best)| distance < best) {
            nearest = Some((candidate, distance));
        }
    }

    let (donor, distance) = nearest?;
    let distance_km = round2(distance).max(MIN_FALLBACK_DISTANCE_KM);
    if distance > max_radius_km || distance_km > max_radius_km {
        tracing::debug!(
            location_id = %target.location_id,
            nearest = %donor.location_id,
            distance_km = distance,
            max_radius_km,
            "nearest fallback donor out of range"
        );
        return None;
    }

    Some(PriceRecord {
        location_id: target.location_id.clone(),
        period: donor.period,
        local_provider_price: donor.local_provider_price,
        green_energy_price: donor.green_energy_price,
        average_price: donor.average_price,
        source: DataSource::Fallback,
        source_location_id: Some(donor.location_id.clone()),
        distance_km,
        coordinates: Some(origin),
        outlier: donor.outlier.clone(),
        extraction_method: donor.extraction_method,
        raw_source_url: donor.raw_source_url.clone(),
    })
}
