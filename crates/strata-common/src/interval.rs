//! State interval record and its on-disk codec.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use crate::error::{Result, StrataError};
use crate::value::StateValue;

/// Maximum serialized size of one interval, in bytes.
pub const MAX_INTERVAL_SIZE: usize = u16::MAX as usize;

/// Bytes common to every serialized interval: type tag, start, end, quark.
const COMMON_SIZE: usize = 1 + 8 + 8 + 4;

// On-disk type tags.
const TYPE_NULL: i8 = -1;
const TYPE_INTEGER: i8 = 0;
const TYPE_STRING: i8 = 1;
const TYPE_LONG: i8 = 2;
const TYPE_DOUBLE: i8 = 3;
const TYPE_BOOLEAN_TRUE: i8 = 4;
const TYPE_BOOLEAN_FALSE: i8 = 5;

/// One state interval: attribute `quark` held `value` for every timestamp
/// in `[start, end]` (both bounds inclusive).
///
/// Intervals are immutable value objects. Once appended to a node, the node
/// owns them.
///
/// Serialized layout (little-endian):
/// - type_tag: 1 byte
/// - start: 8 bytes
/// - end: 8 bytes
/// - quark: 4 bytes
/// - payload: per type (empty / i32 / i64 / f64 / u16 length + bytes + NUL)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInterval {
    start: i64,
    end: i64,
    quark: i32,
    value: StateValue,
}

impl StateInterval {
    /// Creates a new interval.
    ///
    /// Fails if `start > end` or if the serialized form would exceed
    /// [`MAX_INTERVAL_SIZE`].
    pub fn new(start: i64, end: i64, quark: i32, value: StateValue) -> Result<Self> {
        if start > end {
            return Err(StrataError::InvalidInterval { start, end });
        }
        let size = COMMON_SIZE + value.payload_size();
        if size > MAX_INTERVAL_SIZE {
            return Err(StrataError::IntervalTooLarge {
                size,
                max: MAX_INTERVAL_SIZE,
            });
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }

    /// Start time (inclusive).
    pub fn start(&self) -> i64 {
        self.start
    }

    /// End time (inclusive).
    pub fn end(&self) -> i64 {
        self.end
    }

    /// The attribute this interval belongs to.
    pub fn quark(&self) -> i32 {
        self.quark
    }

    /// The state value held across the interval.
    pub fn value(&self) -> &StateValue {
        &self.value
    }

    /// Returns true if `t` falls within this interval.
    pub fn intersects(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// Size of this interval once serialized, in bytes.
    pub fn size_on_disk(&self) -> usize {
        COMMON_SIZE + self.value.payload_size()
    }

    /// Compares intervals by end time; the order nodes keep their lists in.
    pub fn cmp_by_end(&self, other: &StateInterval) -> Ordering {
        self.end.cmp(&other.end)
    }

    /// Serializes this interval into `buf`.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        let tag = match &self.value {
            StateValue::Null => TYPE_NULL,
            StateValue::Boolean(true) => TYPE_BOOLEAN_TRUE,
            StateValue::Boolean(false) => TYPE_BOOLEAN_FALSE,
            StateValue::Integer(_) => TYPE_INTEGER,
            StateValue::Long(_) => TYPE_LONG,
            StateValue::Double(_) => TYPE_DOUBLE,
            StateValue::Str(_) => TYPE_STRING,
        };
        buf.put_i8(tag);
        buf.put_i64_le(self.start);
        buf.put_i64_le(self.end);
        buf.put_i32_le(self.quark);

        match &self.value {
            StateValue::Null | StateValue::Boolean(_) => {}
            StateValue::Integer(v) => buf.put_i32_le(*v),
            StateValue::Long(v) => buf.put_i64_le(*v),
            StateValue::Double(v) => buf.put_f64_le(*v),
            StateValue::Str(s) => {
                buf.put_u16_le(s.len() as u16);
                buf.put_slice(s.as_bytes());
                buf.put_u8(0);
            }
        }
    }

    /// Deserializes one interval from `buf`.
    ///
    /// Fails with a corruption error on an unknown type tag, a truncated
    /// payload, or a missing string terminator.
    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < COMMON_SIZE {
            return Err(StrataError::Corruption(
                "truncated interval header".to_string(),
            ));
        }
        let tag = buf.get_i8();
        let start = buf.get_i64_le();
        let end = buf.get_i64_le();
        let quark = buf.get_i32_le();

        let value = match tag {
            TYPE_NULL => StateValue::Null,
            TYPE_BOOLEAN_TRUE => StateValue::Boolean(true),
            TYPE_BOOLEAN_FALSE => StateValue::Boolean(false),
            TYPE_INTEGER => {
                ensure_remaining(buf, 4)?;
                StateValue::Integer(buf.get_i32_le())
            }
            TYPE_LONG => {
                ensure_remaining(buf, 8)?;
                StateValue::Long(buf.get_i64_le())
            }
            TYPE_DOUBLE => {
                ensure_remaining(buf, 8)?;
                StateValue::Double(buf.get_f64_le())
            }
            TYPE_STRING => {
                ensure_remaining(buf, 2)?;
                let len = buf.get_u16_le() as usize;
                ensure_remaining(buf, len + 1)?;
                let mut bytes = vec![0u8; len];
                buf.copy_to_slice(&mut bytes);
                let s = String::from_utf8(bytes).map_err(|_| {
                    StrataError::Corruption("interval string is not valid UTF-8".to_string())
                })?;
                if buf.get_u8() != 0 {
                    return Err(StrataError::Corruption(
                        "missing string terminator in interval".to_string(),
                    ));
                }
                StateValue::Str(s)
            }
            other => {
                return Err(StrataError::Corruption(format!(
                    "unknown interval type tag: {}",
                    other
                )))
            }
        };

        if start > end {
            return Err(StrataError::Corruption(format!(
                "interval with start {} > end {}",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }
}

impl std::fmt::Display for StateInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}] quark {} = {}",
            self.start, self.end, self.quark, self.value
        )
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        Err(StrataError::Corruption(
            "truncated interval payload".to_string(),
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(interval: &StateInterval) -> StateInterval {
        let mut buf = BytesMut::new();
        interval.write_to(&mut buf);
        assert_eq!(buf.len(), interval.size_on_disk());
        StateInterval::read_from(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn test_new_rejects_inverted_range() {
        let err = StateInterval::new(10, 5, 0, StateValue::Null).unwrap_err();
        assert!(matches!(
            err,
            StrataError::InvalidInterval { start: 10, end: 5 }
        ));
    }

    #[test]
    fn test_new_rejects_oversized_value() {
        let s = "x".repeat(MAX_INTERVAL_SIZE);
        let err = StateInterval::new(0, 1, 0, StateValue::Str(s)).unwrap_err();
        assert!(matches!(err, StrataError::IntervalTooLarge { .. }));
    }

    #[test]
    fn test_intersects() {
        let iv = StateInterval::new(10, 20, 0, StateValue::Null).unwrap();
        assert!(!iv.intersects(9));
        assert!(iv.intersects(10));
        assert!(iv.intersects(15));
        assert!(iv.intersects(20));
        assert!(!iv.intersects(21));
    }

    #[test]
    fn test_point_interval() {
        let iv = StateInterval::new(5, 5, 3, StateValue::Integer(1)).unwrap();
        assert!(iv.intersects(5));
        assert!(!iv.intersects(4));
        assert!(!iv.intersects(6));
    }

    #[test]
    fn test_size_on_disk() {
        let null = StateInterval::new(0, 1, 0, StateValue::Null).unwrap();
        assert_eq!(null.size_on_disk(), 21);

        let int = StateInterval::new(0, 1, 0, StateValue::Integer(9)).unwrap();
        assert_eq!(int.size_on_disk(), 25);

        let s = StateInterval::new(0, 1, 0, StateValue::Str("ab".to_string())).unwrap();
        assert_eq!(s.size_on_disk(), 21 + 2 + 2 + 1);
    }

    #[test]
    fn test_roundtrip_all_types() {
        let values = vec![
            StateValue::Null,
            StateValue::Boolean(true),
            StateValue::Boolean(false),
            StateValue::Integer(0),
            StateValue::Integer(-1),
            StateValue::Integer(i32::MAX),
            StateValue::Long(i64::MIN),
            StateValue::Double(f64::NAN),
            StateValue::Double(-0.0),
            StateValue::Double(std::f64::consts::PI),
            StateValue::Str(String::new()),
            StateValue::Str("a".to_string()),
            StateValue::Str("héllo wörld \u{1F980}".to_string()),
        ];
        for (i, value) in values.into_iter().enumerate() {
            let iv = StateInterval::new(i as i64, i as i64 + 100, i as i32, value).unwrap();
            assert_eq!(roundtrip(&iv), iv);
        }
    }

    #[test]
    fn test_roundtrip_extreme_times() {
        let iv = StateInterval::new(i64::MIN, i64::MAX, i32::MAX, StateValue::Null).unwrap();
        assert_eq!(roundtrip(&iv), iv);
    }

    #[test]
    fn test_read_rejects_unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_i8(99);
        buf.put_i64_le(0);
        buf.put_i64_le(1);
        buf.put_i32_le(0);
        let err = StateInterval::read_from(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_read_rejects_bad_string_terminator() {
        let iv = StateInterval::new(0, 1, 0, StateValue::Str("abc".to_string())).unwrap();
        let mut buf = BytesMut::new();
        iv.write_to(&mut buf);
        let last = buf.len() - 1;
        buf[last] = 0xFF;
        let err = StateInterval::read_from(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_read_rejects_truncated_payload() {
        let iv = StateInterval::new(0, 1, 0, StateValue::Long(42)).unwrap();
        let mut buf = BytesMut::new();
        iv.write_to(&mut buf);
        buf.truncate(buf.len() - 4);
        let err = StateInterval::read_from(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_cmp_by_end() {
        let a = StateInterval::new(0, 10, 0, StateValue::Null).unwrap();
        let b = StateInterval::new(5, 20, 0, StateValue::Null).unwrap();
        assert_eq!(a.cmp_by_end(&b), Ordering::Less);
        assert_eq!(b.cmp_by_end(&a), Ordering::Greater);
        assert_eq!(a.cmp_by_end(&a), Ordering::Equal);
    }
}
