//! The single-tensor binary format: byte-exact header, elementwise
//! round trips over every data type, and stream error handling.

use std::io::Write;

use flint::errors::ErrorKind;
use flint::{DataType, Tensor};

fn round_trip<T>(values: Vec<T>, shape: &[usize], dtype: DataType)
where
    T: flint::data::TensorElement,
{
    let t = Tensor::from_vec(values.clone(), shape).unwrap();
    let bytes = t.serialize().unwrap();
    let back = Tensor::deserialize(&bytes).unwrap();
    assert_eq!(back.shape(), shape);
    assert_eq!(back.data_type(), dtype);
    assert_eq!(back.to_vec::<T>().unwrap(), values);
}

#[test]
fn round_trips_every_data_type() {
    round_trip(vec![1i32, -2, 3, i32::MAX], &[2, 2], DataType::I32);
    round_trip(vec![1i64, -2, 1 << 40, i64::MIN], &[4], DataType::I64);
    round_trip(vec![1.5f32, -2.25, f32::MIN_POSITIVE, 0.0], &[4], DataType::F32);
    round_trip(
        vec![std::f64::consts::PI, -0.0, 1e300, 5.0e-17],
        &[2, 2],
        DataType::F64,
    );
}

#[test]
fn round_trips_computed_results() {
    let a = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let b = a.matmul(&a).unwrap();
    let bytes = b.serialize().unwrap();
    let back = Tensor::deserialize(&bytes).unwrap();
    assert_eq!(back.to_vec::<f64>().unwrap(), b.to_vec::<f64>().unwrap());
}

#[test]
fn header_is_byte_exact() {
    let t = Tensor::from_vec(vec![7.0f64], &[1]).unwrap();
    let bytes = t.serialize().unwrap();
    assert_eq!(&bytes[..4], b"FLNT");
    assert_eq!(bytes[4], 3);
    assert_eq!(i32::from_be_bytes(bytes[5..9].try_into().unwrap()), 1);
    assert_eq!(u64::from_be_bytes(bytes[9..17].try_into().unwrap()), 1);
    assert_eq!(f64::from_ne_bytes(bytes[17..25].try_into().unwrap()), 7.0);
}

#[test]
fn file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tensor.flint");
    let t = Tensor::from_vec(vec![9i64, 8, 7, 6, 5, 4], &[3, 2]).unwrap();
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&t.serialize().unwrap()).unwrap();
    }
    let bytes = std::fs::read(&path).unwrap();
    let back = Tensor::deserialize(&bytes).unwrap();
    assert_eq!(back.to_vec::<i64>().unwrap(), vec![9, 8, 7, 6, 5, 4]);
    assert_eq!(back.shape(), vec![3, 2]);
}

#[test]
fn corrupt_streams_are_io_errors() {
    assert_eq!(
        Tensor::deserialize(b"WRNG\x00").unwrap_err().kind(),
        ErrorKind::IoError
    );
    let t = Tensor::from_vec(vec![1i32, 2, 3, 4], &[4]).unwrap();
    let bytes = t.serialize().unwrap();
    // Truncating the payload must fail cleanly.
    assert_eq!(
        Tensor::deserialize(&bytes[..bytes.len() - 2])
            .unwrap_err()
            .kind(),
        ErrorKind::IoError
    );
    // An unknown tag byte as well.
    let mut bad = bytes.clone();
    bad[4] = 9;
    assert_eq!(
        Tensor::deserialize(&bad).unwrap_err().kind(),
        ErrorKind::IoError
    );
}
