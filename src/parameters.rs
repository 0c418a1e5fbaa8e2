/* Driver parameters: an ordered string vector matching the driver's
 * compile-time parameter name list. Empty strings mean "not set". */

use tracing::warn;

pub struct Parameters {
    names: &'static [&'static str],
    values: Vec<String>,
}

impl Parameters {
    pub fn new(names: &'static [&'static str], values: &[&str]) -> Self {
        let mut values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        values.resize(names.len(), String::new());
        Self { names, values }
    }

    pub fn empty() -> Self {
        Self {
            names: &[],
            values: Vec::new(),
        }
    }

    pub fn get(&self, index: usize) -> &str {
        self.values.get(index).map_or("", |v| v.as_str())
    }

    /* Parse a yes/no setting, keeping `default` (with a warning) on bad
     * input. Accepts the on/off spellings the original tools accepted. */
    pub fn yes_no(&self, index: usize, default: bool) -> bool {
        let word = self.get(index);
        if word.is_empty() {
            return default;
        }
        match word.to_ascii_lowercase().as_str() {
            "yes" | "on" | "true" | "1" => true,
            "no" | "off" | "false" | "0" => false,
            _ => {
                warn!("invalid {} setting: {}", self.names[index], word);
                default
            }
        }
    }

    /* Parse a bounded integer setting. None when unset or out of range. */
    pub fn integer(&self, index: usize, minimum: i32, maximum: i32) -> Option<i32> {
        let word = self.get(index);
        if word.is_empty() {
            return None;
        }
        match word.parse::<i32>() {
            Ok(value) if (minimum..=maximum).contains(&value) => Some(value),
            _ => {
                warn!("invalid {} specification: {}", self.names[index], word);
                None
            }
        }
    }

    pub fn choice(&self, index: usize, choices: &[&str]) -> Option<usize> {
        let word = self.get(index);
        if word.is_empty() {
            return None;
        }
        let position = choices
            .iter()
            .position(|choice| choice.eq_ignore_ascii_case(word));
        if position.is_none() {
            warn!("invalid {} setting: {}", self.names[index], word);
        }
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: &[&str] = &["debugpackets", "statuscells"];

    #[test]
    fn test_missing_values_are_empty() {
        let params = Parameters::new(NAMES, &["yes"]);
        assert_eq!(params.get(0), "yes");
        assert_eq!(params.get(1), "");
    }

    #[test]
    fn test_yes_no() {
        let params = Parameters::new(NAMES, &["on", ""]);
        assert!(params.yes_no(0, false));
        assert!(!params.yes_no(1, false));
    }

    #[test]
    fn test_integer_bounds() {
        let params = Parameters::new(NAMES, &["", "-3"]);
        assert_eq!(params.integer(1, -20, 20), Some(-3));
        assert_eq!(params.integer(1, 0, 20), None);
    }

    #[test]
    fn test_choice_case_insensitive() {
        let params = Parameters::new(&["protocol"], &["Clio"]);
        assert_eq!(params.choice(0, &["clio", "esysiris"]), Some(0));
    }
}
