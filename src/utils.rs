use crate::error::{ForgeError, Result};
use chrono::{Datelike, Days, NaiveDate};

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

pub fn validate_fiscal_year_end_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(ForgeError::InvalidFiscalYearEndMonth(month));
    }
    Ok(())
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Get the fiscal year end date for a given date
/// Returns the fiscal year end date that this date belongs to
pub fn get_fiscal_year_end_for_date(date: NaiveDate, fiscal_month: u32) -> Option<NaiveDate> {
    let current_month = date.month();
    let current_year = date.year();

    // Past the fiscal year end month means the FY closes next calendar year
    if current_month <= fiscal_month {
        last_day_of_month(current_year, fiscal_month)
    } else {
        last_day_of_month(current_year + 1, fiscal_month)
    }
}

/// Last day of fiscal quarter `quarter` (1-4) of the fiscal year that ends in
/// `fiscal_year`/`fiscal_month`.
///
/// # Examples
/// - FY ends Dec: Q1 2024 ends 2024-03-31
/// - FY ends June: Q1 2024 ends 2023-09-30
pub fn fiscal_quarter_end(fiscal_year: i32, quarter: u32, fiscal_month: u32) -> Option<NaiveDate> {
    if !(1..=4).contains(&quarter) {
        return None;
    }
    let fy_end_index = fiscal_year * 12 + fiscal_month as i32 - 1;
    let quarter_end_index = fy_end_index - 3 * (4 - quarter as i32);
    let year = quarter_end_index.div_euclid(12);
    let month = quarter_end_index.rem_euclid(12) as u32 + 1;
    last_day_of_month(year, month)
}

/// Maps a calendar date to `(fiscal_year, fiscal_quarter)`.
pub fn fiscal_quarter_for_date(date: NaiveDate, fiscal_month: u32) -> Option<(i32, u32)> {
    let fy_end = get_fiscal_year_end_for_date(date, fiscal_month)?;
    let months_left = months_between(date, fy_end).clamp(0, 11);
    let quarter = 4 - (months_left / 3) as u32;
    Some((fy_end.year(), quarter))
}

/// Expands a two-digit year (`23` -> 2023, `98` -> 1998).
pub fn expand_two_digit_year(yy: i32) -> i32 {
    if yy < 70 {
        2000 + yy
    } else {
        1900 + yy
    }
}
