pub mod countries;
mod country;

pub use countries::COUNTRY_CODES;
pub use country::{CountryCode, CountryStat, InvalidCountryCode};
