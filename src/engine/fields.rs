use crate::limits::*;
use crate::model::{UserProfile, Vehicle};

use super::error::ValidationError;

/// Upper-case and check a plate: letter/digit groups joined by single hyphens,
/// e.g. `RFWB-77`, `AB-CD-12`, `BBCL12`.
pub(crate) fn normalize_plate(raw: &str) -> Result<String, ValidationError> {
    let plate = raw.trim().to_uppercase();
    if plate.len() > MAX_PLATE_LEN {
        return Err(ValidationError::InvalidPlate(plate));
    }
    let well_formed = !plate.is_empty()
        && plate
            .split('-')
            .all(|group| !group.is_empty() && group.chars().all(|c| c.is_ascii_alphanumeric()));
    if !well_formed {
        return Err(ValidationError::InvalidPlate(plate));
    }
    Ok(plate)
}

/// `D.DDD.DDD-V` or `DD.DDD.DDD-V` where V is a digit or K. Empty is allowed.
pub(crate) fn validate_rut(rut: &str) -> Result<(), ValidationError> {
    if rut.is_empty() {
        return Ok(());
    }
    let bad = || ValidationError::InvalidRut(rut.to_string());
    if rut.len() > MAX_RUT_LEN {
        return Err(bad());
    }
    let (body, check) = rut.rsplit_once('-').ok_or_else(bad)?;
    let mut check_chars = check.chars();
    match (check_chars.next(), check_chars.next()) {
        (Some(c), None) if c.is_ascii_digit() || c == 'k' || c == 'K' => {}
        _ => return Err(bad()),
    }
    let groups: Vec<&str> = body.split('.').collect();
    let digits = |g: &str| g.chars().all(|c| c.is_ascii_digit());
    match groups.as_slice() {
        [head, a, b]
            if (1..=2).contains(&head.len())
                && a.len() == 3
                && b.len() == 3
                && digits(head)
                && digits(a)
                && digits(b) => Ok(()),
        _ => Err(bad()),
    }
}

fn required(value: &str, name: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(name));
    }
    bounded(value, name)
}

fn bounded(value: &str, name: &'static str) -> Result<(), ValidationError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(ValidationError::FieldTooLong(name));
    }
    Ok(())
}

/// Validate a vehicle record and return it with its plate normalized.
pub(crate) fn clean_vehicle(mut v: Vehicle) -> Result<Vehicle, ValidationError> {
    v.plate = normalize_plate(&v.plate)?;
    validate_rut(&v.rut)?;
    required(&v.company, "company")?;
    required(&v.brand, "brand")?;
    required(&v.model, "model")?;
    bounded(&v.vehicle_type, "vehicle_type")?;
    bounded(&v.transmission, "transmission")?;
    if let Some(ref c2) = v.company2 {
        bounded(c2, "company2")?;
    }
    Ok(v)
}

pub(crate) fn clean_user(u: UserProfile) -> Result<UserProfile, ValidationError> {
    required(&u.full_name, "full_name")?;
    required(&u.company, "company")?;
    validate_rut(&u.rut)?;
    bounded(&u.city, "city")?;
    if let Some(ref c2) = u.company2 {
        bounded(c2, "company2")?;
    }
    Ok(u)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plates() {
        assert_eq!(normalize_plate(" rfwb-77 ").unwrap(), "RFWB-77");
        assert_eq!(normalize_plate("AB-CD-12").unwrap(), "AB-CD-12");
        assert_eq!(normalize_plate("BBCL12").unwrap(), "BBCL12");
        assert!(normalize_plate("").is_err());
        assert!(normalize_plate("AB--12").is_err());
        assert!(normalize_plate("-AB12").is_err());
        assert!(normalize_plate("AB 12").is_err());
        assert!(normalize_plate("ABCDE-123456").is_err());
    }

    #[test]
    fn ruts() {
        assert!(validate_rut("").is_ok());
        assert!(validate_rut("80.010.900-0").is_ok());
        assert!(validate_rut("7.654.321-K").is_ok());
        assert!(validate_rut("7.654.321-k").is_ok());
        assert!(validate_rut("80010900-0").is_err());
        assert!(validate_rut("80.010.900-00").is_err());
        assert!(validate_rut("800.010.900-0").is_err());
        assert!(validate_rut("80.010.90-0").is_err());
        assert!(validate_rut("80.010.900-X").is_err());
    }

    #[test]
    fn vehicle_requires_company() {
        let mut v = crate::model::fixtures::vehicle("", "RFWB-77");
        assert_eq!(
            clean_vehicle(v.clone()),
            Err(ValidationError::MissingField("company"))
        );
        v.company = "Acme".into();
        v.plate = "rfwb-77".into();
        assert_eq!(clean_vehicle(v).unwrap().plate, "RFWB-77");
    }

    #[test]
    fn user_field_length() {
        let mut u = crate::model::fixtures::user("Acme", "Ana");
        u.city = "x".repeat(MAX_FIELD_LEN + 1);
        assert_eq!(clean_user(u), Err(ValidationError::FieldTooLong("city")));
    }
}
