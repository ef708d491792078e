// src/holidays.rs

use chrono::{Datelike, Duration, NaiveDate};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HolidayError {
    #[error("Unsupported holiday country: {0}")]
    UnsupportedCountry(String),
    #[error("Unsupported holiday subdivision '{subdivision}' for country {country}")]
    UnsupportedSubdivision {
        country: String,
        subdivision: String,
    },
}

/// Subdivisions with state holidays on top of the Brazilian national ones.
pub const BR_SUBDIVISIONS: &[&str] = &["SP", "RJ", "RS", "PR", "BA", "DF"];

/// Public holidays of one country/subdivision, precomputed for a span of years.
#[derive(Debug, Clone)]
pub struct HolidayCalendar {
    country: String,
    subdivision: Option<String>,
    days: BTreeMap<NaiveDate, String>,
}

impl HolidayCalendar {
    pub fn for_years(
        country: &str,
        subdivision: Option<&str>,
        years: RangeInclusive<i32>,
    ) -> Result<Self, HolidayError> {
        let country = country.trim().to_uppercase();
        let subdivision = subdivision
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty());

        if country != "BR" {
            return Err(HolidayError::UnsupportedCountry(country));
        }
        if let Some(sub) = &subdivision {
            if !BR_SUBDIVISIONS.contains(&sub.as_str()) {
                return Err(HolidayError::UnsupportedSubdivision {
                    country,
                    subdivision: sub.clone(),
                });
            }
        }

        let mut calendar = Self {
            country,
            subdivision,
            days: BTreeMap::new(),
        };
        for year in years {
            calendar.add_brazil_national(year);
            if let Some(sub) = calendar.subdivision.clone() {
                calendar.add_brazil_state(year, &sub);
            }
        }
        Ok(calendar)
    }

    /// `BR` or `BR-SP`.
    pub fn region(&self) -> String {
        match &self.subdivision {
            Some(sub) => format!("{}-{}", self.country, sub),
            None => self.country.clone(),
        }
    }

    pub fn subdivision(&self) -> Option<&str> {
        self.subdivision.as_deref()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&str> {
        self.days.get(&date).map(String::as_str)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    fn insert(&mut self, year: i32, month: u32, day: u32, name: &str) {
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            self.insert_date(date, name);
        }
    }

    fn insert_date(&mut self, date: NaiveDate, name: &str) {
        self.days
            .entry(date)
            .and_modify(|existing| {
                if !existing.split("; ").any(|n| n == name) {
                    existing.push_str("; ");
                    existing.push_str(name);
                }
            })
            .or_insert_with(|| name.to_string());
    }

    fn add_brazil_national(&mut self, year: i32) {
        self.insert(year, 1, 1, "Confraternização Universal");
        if let Some(easter) = easter_sunday(year) {
            self.insert_date(easter - Duration::days(2), "Sexta-feira Santa");
        }
        self.insert(year, 4, 21, "Tiradentes");
        self.insert(year, 5, 1, "Dia do Trabalhador");
        self.insert(year, 9, 7, "Independência do Brasil");
        self.insert(year, 10, 12, "Nossa Senhora Aparecida");
        self.insert(year, 11, 2, "Finados");
        self.insert(year, 11, 15, "Proclamação da República");
        if year >= 2024 {
            self.insert(year, 11, 20, "Dia Nacional de Zumbi e da Consciência Negra");
        }
        self.insert(year, 12, 25, "Natal");
    }

    fn add_brazil_state(&mut self, year: i32, subdivision: &str) {
        match subdivision {
            "SP" => {
                if year >= 1997 {
                    self.insert(year, 7, 9, "Revolução Constitucionalista de 1932");
                }
            }
            "RJ" => {
                if year >= 2008 {
                    self.insert(year, 4, 23, "Dia de São Jorge");
                }
                // From 2024 the national holiday covers this date.
                if (2002..2024).contains(&year) {
                    self.insert(year, 11, 20, "Dia da Consciência Negra");
                }
            }
            "RS" => self.insert(year, 9, 20, "Revolução Farroupilha"),
            "PR" => self.insert(year, 12, 19, "Emancipação Política do Paraná"),
            "BA" => self.insert(year, 7, 2, "Independência da Bahia"),
            "DF" => {
                self.insert(year, 4, 21, "Fundação de Brasília");
                self.insert(year, 11, 30, "Dia do Evangélico");
            }
            _ => {}
        }
    }
}

/// Anonymous Gregorian computus.
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Years worth precomputing around `today`: the audited day can fall in the previous year.
pub fn years_around(today: NaiveDate) -> RangeInclusive<i32> {
    (today.year() - 1)..=(today.year() + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_easter_known_years() {
        assert_eq!(easter_sunday(2024), Some(date(2024, 3, 31)));
        assert_eq!(easter_sunday(2025), Some(date(2025, 4, 20)));
        assert_eq!(easter_sunday(2000), Some(date(2000, 4, 23)));
    }

    #[test]
    fn test_national_holidays() {
        let cal = HolidayCalendar::for_years("BR", None, 2024..=2024).unwrap();
        assert_eq!(cal.get(date(2024, 1, 1)), Some("Confraternização Universal"));
        assert_eq!(cal.get(date(2024, 3, 29)), Some("Sexta-feira Santa"));
        assert!(cal.contains(date(2024, 11, 20)));
        assert!(!cal.contains(date(2024, 1, 10)));
    }

    #[test]
    fn test_black_consciousness_only_national_from_2024() {
        let cal = HolidayCalendar::for_years("BR", Some("SP"), 2023..=2024).unwrap();
        assert!(!cal.contains(date(2023, 11, 20)));
        assert!(cal.contains(date(2024, 11, 20)));
    }

    #[test]
    fn test_sao_paulo_state_holiday() {
        let cal = HolidayCalendar::for_years("br", Some("sp"), 2024..=2024).unwrap();
        assert_eq!(
            cal.get(date(2024, 7, 9)),
            Some("Revolução Constitucionalista de 1932")
        );
        assert_eq!(cal.subdivision(), Some("SP"));
        assert_eq!(cal.region(), "BR-SP");
    }

    #[test]
    fn test_shared_date_joins_names() {
        let cal = HolidayCalendar::for_years("BR", Some("DF"), 2024..=2024).unwrap();
        assert_eq!(
            cal.get(date(2024, 4, 21)),
            Some("Tiradentes; Fundação de Brasília")
        );
    }

    #[test]
    fn test_unsupported_region() {
        assert_eq!(
            HolidayCalendar::for_years("US", None, 2024..=2024).unwrap_err(),
            HolidayError::UnsupportedCountry("US".to_string())
        );
        assert!(matches!(
            HolidayCalendar::for_years("BR", Some("XX"), 2024..=2024),
            Err(HolidayError::UnsupportedSubdivision { .. })
        ));
    }

    #[test]
    fn test_years_around() {
        assert_eq!(years_around(date(2024, 1, 2)), 2023..=2025);
    }
}
