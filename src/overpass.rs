/*! SMAP overpasses and the names of the variables read for them. */

use crate::error::{ReshuffleError, ReshuffleResult};
use chrono::{NaiveDateTime, Timelike};
use rustc_hash::FxHashSet as HashSet;
use strum::EnumIter;

/// Name of the variable flagging which overpass a value came from when reading both.
pub const OVERPASS_VARIABLE: &str = "Overpass";

/** The overpasses recorded in SMAP L3 files. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum Overpass {
    /// The descending, morning, overpass.
    Am,
    /// The ascending, evening, overpass.
    Pm,
    /// Read both overpasses, one after the other for every day.
    Both,
}

impl Overpass {
    /// Get a string representing the name of the overpass.
    pub fn name(&self) -> &'static str {
        use Overpass::*;

        match self {
            Am => "AM",
            Pm => "PM",
            Both => "BOTH",
        }
    }

    /// Parse an overpass name, ignoring case.
    pub fn from_name(name: &str) -> Option<Overpass> {
        use strum::IntoEnumIterator;

        Overpass::iter().find(|op| op.name().eq_ignore_ascii_case(name))
    }

    /// The overpass read for a request at this time when reading both overpasses.
    ///
    /// Requests before noon read the morning overpass, the rest the evening one.
    pub fn for_request(timestamp: NaiveDateTime) -> Overpass {
        if timestamp.hour() < 12 {
            Overpass::Am
        } else {
            Overpass::Pm
        }
    }

    /// Name of the group in the file holding the data for this overpass.
    pub fn group_name(&self) -> String {
        match self {
            Overpass::Both => GROUP_PREFIX.to_string(),
            op => format!("{}_{}", GROUP_PREFIX, op.name()),
        }
    }

    /// Parse the overpass out of a group name, `None` if the group doesn't hold soil moisture.
    ///
    /// A group without an overpass suffix gives `Some("")`.
    pub fn parse_group_name(group: &str) -> Option<&str> {
        let rest = group.strip_prefix(GROUP_PREFIX)?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('_')
        }
    }

    /// Value of the [OVERPASS_VARIABLE] for data from this overpass.
    pub fn flag(&self) -> f64 {
        match self {
            Overpass::Am => 1.0,
            Overpass::Pm => 2.0,
            Overpass::Both => f64::NAN,
        }
    }

    fn variable_suffix(&self) -> &'static str {
        match self {
            Overpass::Am => "_am",
            Overpass::Pm => "_pm",
            Overpass::Both => "",
        }
    }
}

const GROUP_PREFIX: &str = "Soil_Moisture_Retrieval_Data";

/// Dataset names and output names for one requested parameter.
#[derive(Debug, Clone)]
struct ParameterNames {
    parameter: String,
    output_am: String,
    output_pm: String,
}

/**
 * Mapping from a requested parameter and the overpass it was read for to the name of the dataset
 * in the file and the name of the variable in the output.
 *
 * This is built and checked once when the reader is set up.
 */
#[derive(Debug, Clone)]
pub struct VariableNaming {
    overpass: Option<Overpass>,
    names: Vec<ParameterNames>,
}

impl VariableNaming {
    /**
     * Build the naming table.
     *
     * #Arguments
     * * parameters - the parameters to read, as named for the morning overpass.
     * * overpass - the configured overpass, if any.
     * * var_overpass_str - append `_am` or `_pm` to output names of single overpass reads.
     * * time_key - name of the per observation time variable, it is never renamed.
     */
    pub fn new(
        parameters: &[String],
        overpass: Option<Overpass>,
        var_overpass_str: bool,
        time_key: Option<&str>,
    ) -> ReshuffleResult<Self> {
        if parameters.is_empty() {
            return Err(ReshuffleError::Config("no parameters to read".into()));
        }

        let rename = |parameter: &str, op: Overpass| -> String {
            let keep = !var_overpass_str
                || overpass.is_none()
                || overpass == Some(Overpass::Both)
                || parameter.ends_with(op.variable_suffix())
                || Some(parameter) == time_key;

            if keep {
                parameter.to_string()
            } else {
                format!("{}{}", parameter, op.variable_suffix())
            }
        };

        let names: Vec<ParameterNames> = parameters
            .iter()
            .map(|p| ParameterNames {
                parameter: p.clone(),
                output_am: rename(p, Overpass::Am),
                output_pm: rename(p, Overpass::Pm),
            })
            .collect();

        // Only the names of the overpass actually read can collide.
        let op = match overpass {
            Some(Overpass::Pm) => Overpass::Pm,
            _ => Overpass::Am,
        };

        let mut seen = HashSet::default();
        for entry in &names {
            let output = entry.output(op);
            if !seen.insert(output) {
                return Err(ReshuffleError::Config(format!(
                    "more than one parameter is written to the variable {}",
                    output
                )));
            }
            if overpass == Some(Overpass::Both) && output == OVERPASS_VARIABLE {
                return Err(ReshuffleError::Config(format!(
                    "the parameter name {} is reserved when reading both overpasses",
                    OVERPASS_VARIABLE
                )));
            }
        }

        Ok(VariableNaming { overpass, names })
    }

    /// The configured overpass.
    pub fn overpass(&self) -> Option<Overpass> {
        self.overpass
    }

    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.parameter.as_str())
    }

    /// Name of the dataset in the file holding `parameter` for the overpass `op`.
    ///
    /// Evening datasets carry a `_pm` suffix, everything else uses the plain name.
    pub fn dataset_name(parameter: &str, op: Option<Overpass>) -> String {
        match op {
            Some(Overpass::Pm) => format!("{}_pm", parameter),
            _ => parameter.to_string(),
        }
    }

    /// Output variable name of `parameter` read for the overpass `op`.
    pub fn output_name(&self, parameter: &str, op: Option<Overpass>) -> Option<&str> {
        let entry = self.names.iter().find(|n| n.parameter == parameter)?;
        Some(match op {
            Some(op) => entry.output(op),
            None => &entry.parameter,
        })
    }
}

impl ParameterNames {
    fn output(&self, op: Overpass) -> &str {
        match op {
            Overpass::Am => &self.output_am,
            Overpass::Pm => &self.output_pm,
            Overpass::Both => &self.parameter,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_names_and_groups() {
        assert_eq!(Overpass::from_name("pm"), Some(Overpass::Pm));
        assert_eq!(Overpass::from_name("Both"), Some(Overpass::Both));
        assert_eq!(Overpass::from_name("noon"), None);

        assert_eq!(Overpass::Am.group_name(), "Soil_Moisture_Retrieval_Data_AM");
        assert_eq!(Overpass::parse_group_name("Soil_Moisture_Retrieval_Data_PM"), Some("PM"));
        assert_eq!(Overpass::parse_group_name("Soil_Moisture_Retrieval_Data"), Some(""));
        assert_eq!(Overpass::parse_group_name("Metadata"), None);
    }

    #[test]
    fn test_overpass_from_request_time() {
        let day = NaiveDate::from_ymd(2020, 4, 1);
        assert_eq!(Overpass::for_request(day.and_hms(0, 0, 0)), Overpass::Am);
        assert_eq!(Overpass::for_request(day.and_hms(12, 0, 0)), Overpass::Pm);
    }

    #[test]
    fn test_suffixes() {
        let naming = VariableNaming::new(
            &params(&["soil_moisture", "retrieval_qual_flag_am", "tb_time_seconds"]),
            Some(Overpass::Am),
            true,
            Some("tb_time_seconds"),
        )
        .unwrap();

        let op = Some(Overpass::Am);
        assert_eq!(naming.output_name("soil_moisture", op), Some("soil_moisture_am"));
        assert_eq!(
            naming.output_name("retrieval_qual_flag_am", op),
            Some("retrieval_qual_flag_am")
        );
        assert_eq!(naming.output_name("tb_time_seconds", op), Some("tb_time_seconds"));
        assert_eq!(naming.output_name("unknown", op), None);

        let op = Some(Overpass::Pm);
        assert_eq!(naming.output_name("soil_moisture", op), Some("soil_moisture_pm"));
        assert_eq!(VariableNaming::dataset_name("soil_moisture", op), "soil_moisture_pm");
        assert_eq!(
            VariableNaming::dataset_name("soil_moisture", Some(Overpass::Am)),
            "soil_moisture"
        );
    }

    #[test]
    fn test_no_suffix_cases() {
        let p = params(&["soil_moisture"]);

        let plain = VariableNaming::new(&p, Some(Overpass::Pm), false, None).unwrap();
        assert_eq!(plain.output_name("soil_moisture", Some(Overpass::Pm)), Some("soil_moisture"));

        let both = VariableNaming::new(&p, Some(Overpass::Both), true, None).unwrap();
        assert_eq!(both.output_name("soil_moisture", Some(Overpass::Pm)), Some("soil_moisture"));
        assert_eq!(both.output_name("soil_moisture", Some(Overpass::Am)), Some("soil_moisture"));
    }

    #[test]
    fn test_rejects_colliding_names() {
        assert!(VariableNaming::new(&[], None, true, None).is_err());

        let collide = params(&["soil_moisture", "soil_moisture_am"]);
        assert!(VariableNaming::new(&collide, Some(Overpass::Am), true, None).is_err());

        let reserved = params(&["Overpass"]);
        assert!(VariableNaming::new(&reserved, Some(Overpass::Both), true, None).is_err());
    }
}
