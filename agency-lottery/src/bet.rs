use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of comma separated fields in one wire record.
pub const RECORD_FIELDS: usize = 7;

/// A single wager placed at an agency.
///
/// Two bets are the same wager when they share the agency and the bettor's
/// document; the remaining fields are carried along untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub agency: u32,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: NaiveDate,
    pub number: u32,
}

impl PartialEq for Bet {
    fn eq(&self, other: &Self) -> bool {
        self.agency == other.agency && self.document == other.document
    }
}

impl Eq for Bet {}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidBet {
    #[error("expected {RECORD_FIELDS} fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field}: {value:?}")]
    Field { field: &'static str, value: String },
}

impl Bet {
    /// Parses one wire record: `agency,bet_id,first_name,last_name,document,birthdate,number`.
    ///
    /// The per-agency `bet_id` must be numeric but is not kept.
    pub fn from_record(record: &str) -> Result<Self, InvalidBet> {
        let fields: Vec<&str> = record.split(',').collect();
        let [agency, bet_id, first_name, last_name, document, birthdate, number] =
            fields.as_slice()
        else {
            return Err(InvalidBet::FieldCount(fields.len()));
        };

        let agency = parse_agency(agency)?;
        bet_id
            .parse::<u32>()
            .map_err(|_| invalid("bet_id", bet_id))?;
        let birthdate = NaiveDate::parse_from_str(birthdate, "%Y-%m-%d")
            .map_err(|_| invalid("birthdate", birthdate))?;
        let number = number.parse().map_err(|_| invalid("number", number))?;

        if document.is_empty() || !document.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("document", document));
        }

        Ok(Self {
            agency,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: document.to_string(),
            birthdate,
            number,
        })
    }

    /// Encodes the bet back into its wire record using the given per-agency id.
    pub fn to_record(&self, bet_id: u32) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.agency,
            bet_id,
            self.first_name,
            self.last_name,
            self.document,
            self.birthdate.format("%Y-%m-%d"),
            self.number
        )
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agency {} document {}", self.agency, self.document)
    }
}

fn parse_agency(value: &str) -> Result<u32, InvalidBet> {
    match value.parse::<u32>() {
        Ok(agency) if agency > 0 => Ok(agency),
        _ => Err(invalid("agency", value)),
    }
}

fn invalid(field: &'static str, value: &str) -> InvalidBet {
    InvalidBet::Field {
        field,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_record() {
        let bet = Bet::from_record("1,7,Juan,Perez,30111222,1990-01-01,4321")
            .expect("valid record");
        assert_eq!(bet.agency, 1);
        assert_eq!(bet.first_name, "Juan");
        assert_eq!(bet.last_name, "Perez");
        assert_eq!(bet.document, "30111222");
        assert_eq!(bet.birthdate, NaiveDate::from_ymd_opt(1990, 1, 1).unwrap());
        assert_eq!(bet.number, 4321);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = Bet::from_record("1,7,Juan,Perez,30111222,1990-01-01").unwrap_err();
        assert_eq!(err, InvalidBet::FieldCount(6));
    }

    #[test]
    fn rejects_agency_zero_and_bad_dates() {
        assert!(matches!(
            Bet::from_record("0,7,Juan,Perez,30111222,1990-01-01,4321"),
            Err(InvalidBet::Field { field: "agency", .. })
        ));
        assert!(matches!(
            Bet::from_record("1,7,Juan,Perez,30111222,1990-13-01,4321"),
            Err(InvalidBet::Field { field: "birthdate", .. })
        ));
        assert!(matches!(
            Bet::from_record("1,7,Juan,Perez,30A11222,1990-01-01,4321"),
            Err(InvalidBet::Field { field: "document", .. })
        ));
    }

    #[test]
    fn identity_is_agency_and_document() {
        let a = Bet::from_record("2,1,Ana,Lopez,111,1980-05-05,10").unwrap();
        let b = Bet::from_record("2,9,Otra,Persona,111,2000-01-01,99").unwrap();
        let c = Bet::from_record("3,1,Ana,Lopez,111,1980-05-05,10").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn record_encoding_is_accepted_by_the_parser() {
        let bet = Bet::from_record("4,12,María,Núñez,27000111,2001-12-31,7574").unwrap();
        let record = bet.to_record(12);
        assert_eq!(record, "4,12,María,Núñez,27000111,2001-12-31,7574");
    }
}
