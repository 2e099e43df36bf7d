use crate::message_tag::MessageTag;
use thiserror::Error;

/// A decoded EMU-2 message
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    InstantaneousDemand {
        device_id: String,
        /// `None` when the meter reports a zero divisor
        demand_kw: Option<f64>,
    },
    Summation {
        device_id: String,
        delivered_kwh: f64,
        received_kwh: f64,
    },
    ConnectionStatus {
        device_id: String,
        status: String,
    },
}

impl Reading {
    pub fn device_id(&self) -> &str {
        match self {
            Reading::InstantaneousDemand { device_id, .. }
            | Reading::Summation { device_id, .. }
            | Reading::ConnectionStatus { device_id, .. } => device_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed XML: {0}")]
    Malformed(#[from] roxmltree::Error),
    #[error("unknown message tag <{0}>")]
    UnknownTag(String),
    #[error("missing field <{0}>")]
    MissingField(&'static str),
    #[error("field <{field}> is not a hex number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("zero divisor in <{0}>")]
    ZeroDivisor(&'static str),
}

/// Parses one complete message produced by the fragment assembler.
pub fn decode(fragment: &str) -> Result<Reading, DecodeError> {
    let document = roxmltree::Document::parse(fragment)?;
    let root = document.root_element();
    let name = root.tag_name().name();

    let tag = MessageTag::from_name(name).ok_or_else(|| DecodeError::UnknownTag(name.to_string()))?;
    let fields = Fields(root);

    match tag {
        MessageTag::InstantaneousDemand => {
            let device_id = fields.text("DeviceMacId")?.to_string();
            let demand = fields.hex("Demand")?;
            let multiplier = fields.hex("Multiplier")?;
            let divisor = fields.hex("Divisor")?;
            let digits_right = fields.hex("DigitsRight")?;

            let demand_kw = (divisor != 0).then(|| {
                let kw = (demand * multiplier) as f64 / divisor as f64;
                round_to_digits(kw, digits_right)
            });
            Ok(Reading::InstantaneousDemand {
                device_id,
                demand_kw,
            })
        }
        MessageTag::CurrentSummationDelivered => {
            let device_id = fields.text("DeviceMacId")?.to_string();
            let multiplier = fields.hex("Multiplier")?;
            let divisor = fields.hex("Divisor")?;
            let delivered = fields.hex("SummationDelivered")?;
            let received = fields.hex("SummationReceived")?;

            if divisor == 0 {
                return Err(DecodeError::ZeroDivisor(tag.name()));
            }
            Ok(Reading::Summation {
                device_id,
                delivered_kwh: scale(delivered, multiplier, divisor),
                received_kwh: scale(received, multiplier, divisor),
            })
        }
        MessageTag::ConnectionStatus => Ok(Reading::ConnectionStatus {
            device_id: fields.text("DeviceMacId")?.to_string(),
            status: fields.text("Status")?.to_string(),
        }),
    }
}

/// Multiplies in integers, then divides once in floating point
fn scale(value: u128, multiplier: u128, divisor: u128) -> f64 {
    (value * multiplier) as f64 / divisor as f64
}

/// Rounds to `digits` decimal places, halves away from zero (0.0625 -> 0.063).
///
/// The tie check is made on the scaled f64, not on the exact decimal value
/// of `value`, so 0.015 rounds to 0.02 at two digits even though the stored
/// double is slightly below 0.015.
pub fn round_to_digits(value: f64, digits: u128) -> f64 {
    // f64 has no more than 17 significant digits
    let digits = digits.min(17) as i32;
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Child element lookup on a message root
struct Fields<'a, 'input>(roxmltree::Node<'a, 'input>);

impl<'a, 'input> Fields<'a, 'input> {
    fn text(&self, field: &'static str) -> Result<&'a str, DecodeError> {
        self.0
            .children()
            .find(|node| node.has_tag_name(field))
            .and_then(|node| node.text())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(DecodeError::MissingField(field))
    }

    fn hex(&self, field: &'static str) -> Result<u128, DecodeError> {
        let text = self.text(field)?;
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        u64::from_str_radix(digits, 16)
            .map(u128::from)
            .map_err(|_| DecodeError::InvalidNumber {
                field,
                value: text.to_string(),
            })
    }
}
