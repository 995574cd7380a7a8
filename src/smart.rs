//! Temperature extraction from `smartctl -A` attribute tables.

/// Attribute names carrying the drive temperature, most specific first.
const TEMPERATURE_ATTRIBUTES: [&str; 2] = ["Temperature_Celsius", "Airflow_Temperature_Cel"];

/// Extracts the drive temperature in whole degrees Celsius.
///
/// Returns `None` when no temperature attribute line carries a number.
///
/// # Example
///
/// ```
/// use fancontrold::smart::parse_temperature;
///
/// let line = "194 Temperature_Celsius 0x0022 036 045 000 Old_age Always - 36 (Min/Max 20/45)";
/// assert_eq!(parse_temperature(line), Some(36));
/// ```
pub fn parse_temperature(output: &str) -> Option<i64> {
    TEMPERATURE_ATTRIBUTES
        .iter()
        .filter_map(|attr| output.lines().find(|line| line.contains(attr)))
        .find_map(parse_attribute_line)
}

fn parse_attribute_line(line: &str) -> Option<i64> {
    let line = strip_annotation(line.trim_end());
    let fields: Vec<&str> = line.split_whitespace().collect();

    let last = fields.last()?;
    if let Ok(value) = last.split('(').next().unwrap_or(last).parse() {
        return Some(value);
    }

    // Raw values such as "36 0 0" put the reading before trailing counters;
    // only the second half of the line belongs to RAW_VALUE.
    let tail = fields.len() - fields.len() / 2;
    fields
        .iter()
        .rev()
        .take(tail)
        .find(|field| field.chars().all(|c| c.is_ascii_digit()))
        .and_then(|field| field.parse().ok())
}

/// Drops a trailing "(...)" group such as "(Min/Max 20/45)".
fn strip_annotation(line: &str) -> &str {
    if !line.ends_with(')') {
        return line;
    }
    match line.rfind('(') {
        Some(open) => &line[..open],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ATA_OUTPUT: &str = "\
smartctl 7.3 2022-02-28 r5338 [x86_64-linux-6.1.0] (local build)
=== START OF READ SMART DATA SECTION ===
SMART Attributes Data Structure revision number: 16
ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  1 Raw_Read_Error_Rate     0x002f   200   200   051    Pre-fail  Always       -       0
  9 Power_On_Hours          0x0032   070   070   000    Old_age   Always       -       22378
190 Airflow_Temperature_Cel 0x0022   066   052   045    Old_age   Always       -       34
194 Temperature_Celsius     0x0022   113   098   000    Old_age   Always       -       37
";

    #[test]
    fn plain_raw_value() {
        assert_eq!(parse_temperature(ATA_OUTPUT), Some(37));
    }

    #[test]
    fn min_max_annotation_with_space() {
        let line = "194 Temperature_Celsius     0x0022   036   045   000    Old_age   Always       -       36 (Min/Max 20/45)";
        assert_eq!(parse_temperature(line), Some(36));
    }

    #[test]
    fn annotation_glued_to_value() {
        let line = "194 Temperature_Celsius     0x0022   036   045   000    Old_age   Always       -       41(Min/Max 20/45)";
        assert_eq!(parse_temperature(line), Some(41));
    }

    #[test]
    fn counters_annotation_is_ignored() {
        let line = "194 Temperature_Celsius     0x0022   034   050   000    Old_age   Always       -       34 (0 18 0 0 0)";
        assert_eq!(parse_temperature(line), Some(34));
    }

    #[test]
    fn non_numeric_last_field_falls_back_to_backwards_scan() {
        let line = "194 Temperature_Celsius     0x0022   100   100   000    Old_age   Always       -       38 n/a";
        assert_eq!(parse_temperature(line), Some(38));
    }

    #[test]
    fn airflow_attribute_used_when_celsius_missing() {
        let output = "190 Airflow_Temperature_Cel 0x0022   066   052   045    Old_age   Always       -       33";
        assert_eq!(parse_temperature(output), Some(33));
    }

    #[test]
    fn no_temperature_line() {
        let output = "  9 Power_On_Hours          0x0032   070   070   000    Old_age   Always       -       22378";
        assert_eq!(parse_temperature(output), None);
        assert_eq!(parse_temperature(""), None);
    }

    #[test]
    fn non_numeric_tail_is_none() {
        let line = "Temperature_Celsius - - - - x";
        assert_eq!(parse_temperature(line), None);
    }
}
