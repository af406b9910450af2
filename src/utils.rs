//! Temperature and range helpers shared by the codecs.

/// Convert Fahrenheit to Celsius.
///
/// The controller reports every temperature in whole degrees Fahrenheit;
/// this is used by readings for callers that display Celsius.
///
/// # Example
///
/// ```
/// use pitlink_ble::fahrenheit_to_celsius;
///
/// let celsius = fahrenheit_to_celsius(212.0);
/// assert!((celsius - 100.0).abs() < 0.001);
/// ```
#[inline]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Convert Celsius to Fahrenheit.
#[inline]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Clamp a value into `0` or `min..=max`.
///
/// Zero passes through untouched (it means "disabled" on the controller);
/// anything else is pulled into the range.
#[inline]
pub(crate) fn clamp_optional(value: u16, min: u16, max: u16) -> u16 {
    if value == 0 {
        0
    } else {
        value.clamp(min, max)
    }
}
