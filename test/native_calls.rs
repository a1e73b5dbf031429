//! Calls into the native fixture library (native/fixture.c)
//!
//! The fixture is compiled by build.rs. When no C compiler was available the
//! fixture path is empty and every test here returns early.

use std::sync::Arc;

use nativecall::ffi::{
    BufferSpec, CallOptions, FfiError, FfiSignature, FfiType, FfiValue, HeaderParser, HostArray,
    Library, ScalarType, SignatureFile,
};
use ndarray::{array, Array1, Array2};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

const FIXTURE: &str = env!("NC_FIXTURE_LIB");
const FIXTURE_FFI: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/native/fixture.ffi");
const FIXTURE_H: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/native/fixture.h");

/// The fixture keeps a process-global call counter; tests observing it
/// must not interleave.
static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn open_with(options: CallOptions) -> Option<(MutexGuard<'static, ()>, Library)> {
    if FIXTURE.is_empty() {
        eprintln!("skipping: native fixture was not built");
        return None;
    }
    let guard = SERIAL.lock();
    let lib = Library::open_with(FIXTURE, options).expect("fixture should load");
    let signatures = SignatureFile::parse_file(FIXTURE_FFI).expect("fixture.ffi should parse");
    let bound = unsafe { lib.bind_all(signatures) }.expect("fixture signatures should bind");
    assert!(bound > 0);
    Some((guard, lib))
}

fn fixture() -> Option<(MutexGuard<'static, ()>, Library)> {
    open_with(CallOptions::default())
}

fn native_calls(lib: &Library) -> u64 {
    lib.call("calls_made", &mut [])
        .unwrap()
        .as_u64()
        .unwrap()
}

#[test]
fn test_scalar_identity_round_trip() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    macro_rules! values {
        ($($v:expr),* $(,)?) => {
            vec![$(FfiValue::from($v)),*]
        };
    }

    let cases: Vec<(&str, Vec<FfiValue>)> = vec![
        ("id_i8", values![i8::MIN, -1i8, 0i8, i8::MAX]),
        ("id_i16", values![i16::MIN, -1i16, i16::MAX]),
        ("id_i32", values![i32::MIN, 0i32, i32::MAX]),
        ("id_i64", values![i64::MIN, -1i64, i64::MAX]),
        ("id_u8", values![0u8, 128u8, u8::MAX]),
        ("id_u16", values![0u16, u16::MAX]),
        ("id_u32", values![0u32, 1u32 << 31, u32::MAX]),
        ("id_u64", values![0u64, 1u64 << 63, u64::MAX]),
        (
            "id_f32",
            values![f32::MIN, -0.0f32, f32::MIN_POSITIVE, 1.5f32, f32::MAX],
        ),
        (
            "id_f64",
            values![f64::MIN, -0.0f64, f64::EPSILON, std::f64::consts::PI, f64::MAX],
        ),
    ];

    for (function, values) in cases {
        for value in values {
            let result = lib.call(function, &mut [value.clone()]).unwrap();
            assert_eq!(result, value, "{} did not round-trip", function);
        }
    }
}

#[test]
fn test_sum_array_linspace() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let data = Array1::linspace(0.0, 1.0, 100_000);
    let n = data.len();
    let total = lib
        .call("sum_array", &mut [FfiValue::from(data), FfiValue::from(n)])
        .unwrap()
        .as_f64()
        .unwrap();

    let expected = 50_000.0;
    assert!(
        ((total - expected) / expected).abs() < 1e-6,
        "sum was {}",
        total
    );
}

#[test]
fn test_shape_error_prevents_call() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let before_native = native_calls(&lib);
    let before_binder = lib.call_count("sum_array").unwrap();

    // Wrong element type
    let ints: Array1<i32> = Array1::from_vec(vec![1, 2, 3]);
    let err = lib
        .call("sum_array", &mut [FfiValue::from(ints), FfiValue::from(3usize)])
        .unwrap_err();
    match &err {
        FfiError::ShapeError {
            function,
            index,
            expected,
            actual,
        } => {
            assert_eq!(function, "sum_array");
            assert_eq!(*index, 0);
            assert!(expected.contains("f64"), "expected was {}", expected);
            assert!(actual.contains("i32"), "actual was {}", actual);
        }
        other => panic!("expected ShapeError, got {:?}", other),
    }

    // Wrong ndim
    let matrix = Array2::<f64>::zeros((2, 2));
    let err = lib
        .call("sum_array", &mut [FfiValue::from(matrix), FfiValue::from(4usize)])
        .unwrap_err();
    assert!(matches!(err, FfiError::ShapeError { index: 0, .. }));

    assert_eq!(native_calls(&lib), before_native);
    assert_eq!(lib.call_count("sum_array"), Some(before_binder));
}

#[test]
fn test_fixed_shape_buffer() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let m = array![[1i32, 2, 3], [4, 5, 6], [7, 8, 9]];
    let trace = lib.call("trace_3x3", &mut [FfiValue::from(m.clone())]).unwrap();
    assert_eq!(trace, FfiValue::Int(15));

    let small = array![[1i32, 2], [3, 4]];
    assert!(matches!(
        lib.call("trace_3x3", &mut [FfiValue::from(small)]),
        Err(FfiError::ShapeError { .. })
    ));

    // A transposed view is not C-contiguous
    let transposed = m.reversed_axes();
    assert!(matches!(
        lib.call("trace_3x3", &mut [FfiValue::from(transposed)]),
        Err(FfiError::ShapeError { .. })
    ));
}

#[test]
fn test_writable_buffer_is_updated_in_place() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let mut args = [
        FfiValue::from(array![1.0f64, 2.0, 3.0]),
        FfiValue::from(3usize),
        FfiValue::from(2.0f64),
    ];
    let result = lib.call("scale_inplace", &mut args).unwrap();
    assert!(result.is_void());

    let scaled = args[0].as_array().unwrap();
    assert_eq!(scaled.to_f64_vec(), vec![2.0, 4.0, 6.0]);
}

#[test]
fn test_out_parameter() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let mut args = [FfiValue::from(17), FfiValue::from(5), FfiValue::out(0i32)];
    let quotient = lib.call("divmod", &mut args).unwrap();
    assert_eq!(quotient, FfiValue::Int(3));
    assert_eq!(args[2].as_i64(), Some(2));

    // The slot can also start out null; the callee checks for it
    let mut args = [FfiValue::from(17), FfiValue::from(5), FfiValue::Null];
    assert_eq!(lib.call("divmod", &mut args).unwrap(), FfiValue::Int(3));
}

#[test]
fn test_null_reaches_native_side() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    assert_eq!(
        lib.call("is_null", &mut [FfiValue::Null]).unwrap(),
        FfiValue::Int(1)
    );
    assert_eq!(
        lib.call("is_null", &mut [FfiValue::from(HostArray::from(vec![1u8, 2, 3]))]).unwrap(),
        FfiValue::Int(0)
    );
    assert_eq!(
        lib.call("text_length", &mut [FfiValue::Null]).unwrap(),
        FfiValue::UInt(usize::MAX as u64)
    );
    assert_eq!(lib.call("null_pointer", &mut []).unwrap(), FfiValue::Null);
}

#[test]
fn test_text_arguments_and_returns() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    assert_eq!(
        lib.call("fixture_version", &mut []).unwrap(),
        FfiValue::Str("fixture 1.0".to_string())
    );
    assert_eq!(
        lib.call("text_length", &mut [FfiValue::from("hello")]).unwrap(),
        FfiValue::UInt(5)
    );

    let err = lib.call("text_length", &mut [FfiValue::from("héllo")]).unwrap_err();
    assert!(matches!(err, FfiError::TypeError { index: 0, .. }));
}

#[test]
fn test_load_failure_is_deterministic() {
    for _ in 0..5 {
        let err = Library::open("/definitely/not/here/libmissing.so").unwrap_err();
        assert!(matches!(err, FfiError::LoadError(_)), "got {:?}", err);
    }
}

#[test]
fn test_argument_count_mismatch() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let before = native_calls(&lib);
    let err = lib.call("divmod", &mut [FfiValue::from(1), FfiValue::from(2)]).unwrap_err();
    assert!(matches!(
        err,
        FfiError::InvalidArgCount {
            expected: 3,
            got: 2,
            ..
        }
    ));
    assert_eq!(native_calls(&lib), before);
}

#[test]
fn test_unbound_function() {
    if FIXTURE.is_empty() {
        return;
    }
    let lib = Library::open(FIXTURE).unwrap();
    let err = lib.call("id_i32", &mut [FfiValue::from(1)]).unwrap_err();
    assert!(matches!(err, FfiError::FunctionNotFound(_)));

    let err = unsafe { lib.bind(FfiSignature::new("not_exported", vec![], FfiType::Void)) }
        .unwrap_err();
    assert!(matches!(err, FfiError::SymbolNotFound(_)));
}

#[test]
fn test_scalar_truncation_and_strict_mode() {
    let truncating = CallOptions {
        strict_scalars: false,
    };
    let Some((guard, lib)) = open_with(truncating) else {
        return;
    };

    // Narrowed like a C cast
    assert_eq!(
        lib.call("id_i8", &mut [FfiValue::from(300)]).unwrap(),
        FfiValue::Int(44)
    );
    assert_eq!(
        lib.call("id_u8", &mut [FfiValue::from(-1)]).unwrap(),
        FfiValue::UInt(255)
    );
    drop(lib);
    drop(guard);

    let Some((_guard, strict)) = open_with(CallOptions::strict()) else {
        return;
    };
    let err = strict.call("id_i8", &mut [FfiValue::from(300)]).unwrap_err();
    assert!(matches!(err, FfiError::TypeError { index: 0, .. }));
    assert_eq!(
        strict.call("id_i8", &mut [FfiValue::from(-128)]).unwrap(),
        FfiValue::Int(-128)
    );
}

#[test]
fn test_variadic_call() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };

    let total = lib
        .call(
            "sum_longs",
            &mut [
                FfiValue::from(3),
                FfiValue::from(10i64),
                FfiValue::from(20i64),
                FfiValue::from(-5i64),
            ],
        )
        .unwrap();
    assert_eq!(total, FfiValue::Int(25));

    let total = lib.call("sum_longs", &mut [FfiValue::from(0)]).unwrap();
    assert_eq!(total, FfiValue::Int(0));
}

#[test]
fn test_concurrent_calls() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };
    let lib = Arc::new(lib);

    let handles: Vec<_> = (0..4i64)
        .map(|t| {
            let lib = Arc::clone(&lib);
            std::thread::spawn(move || {
                for i in 0..100i64 {
                    let v = t * 1000 + i;
                    assert_eq!(
                        lib.call("id_i64", &mut [FfiValue::from(v)]).unwrap(),
                        FfiValue::Int(v)
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(lib.call_count("id_i64"), Some(400));
}

#[test]
fn test_header_and_signature_file_agree() {
    let from_file = SignatureFile::parse_file(FIXTURE_FFI).unwrap();
    let from_header = HeaderParser::new()
        .with_export_macro("NC_EXPORT")
        .parse_file(FIXTURE_H)
        .unwrap();

    // Scalar-only prototypes map identically; buffer constraints and out
    // slots can only be expressed in the .ffi form
    for name in ["id_i8", "id_u64", "id_f32", "fixture_version", "sum_longs"] {
        let header_sig = from_header.iter().find(|s| s.name == name).unwrap();
        assert_eq!(Some(header_sig), from_file.get(name), "{}", name);
    }

    let divmod = from_header.iter().find(|s| s.name == "divmod").unwrap();
    assert_eq!(divmod.to_string(), "i32 divmod(i32, i32, buffer_mut<i32>)");
    assert_eq!(
        from_file.get("divmod").unwrap().to_string(),
        "i32 divmod(i32, i32, out<i32>)"
    );

    let sum = from_header.iter().find(|s| s.name == "sum_array").unwrap();
    assert_eq!(
        sum.params[0],
        FfiType::Buffer(BufferSpec::new(ScalarType::F64))
    );
    assert_eq!(
        FfiSignature::parse("f64 sum_array(buffer<f64>, usize)").as_ref(),
        Some(sum)
    );
}

#[test]
fn test_header_signatures_write_through_buffers() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };
    let from_header = HeaderParser::new()
        .with_export_macro("NC_EXPORT")
        .parse_file(FIXTURE_H)
        .unwrap();
    let declared: Vec<FfiSignature> = from_header
        .into_iter()
        .filter(|s| s.name == "scale_inplace" || s.name == "divmod")
        .collect();
    assert_eq!(declared.len(), 2);
    // Rebinding replaces the .ffi declarations
    assert_eq!(unsafe { lib.bind_all(declared) }.unwrap(), 2);

    let scale = lib.signature("scale_inplace").unwrap();
    assert_eq!(
        scale.params[0],
        FfiType::Buffer(BufferSpec::new(ScalarType::F64).writable())
    );

    let mut args = [
        FfiValue::from(array![1.5f64, -2.0, 4.0]),
        FfiValue::from(3usize),
        FfiValue::from(2.0f64),
    ];
    lib.call("scale_inplace", &mut args).unwrap();
    assert_eq!(args[0].as_array().unwrap().to_f64_vec(), vec![3.0, -4.0, 8.0]);

    // A one-element array stands in for the remainder slot
    let mut args = [
        FfiValue::from(17),
        FfiValue::from(5),
        FfiValue::from(HostArray::from(vec![0i32])),
    ];
    assert_eq!(lib.call("divmod", &mut args).unwrap(), FfiValue::Int(3));
    assert_eq!(args[2].as_array().unwrap().get_f64(0), Some(2.0));

    // A single boxed slot is refused where the callee may write n elements
    let before = native_calls(&lib);
    let err = lib
        .call(
            "scale_inplace",
            &mut [
                FfiValue::out(0.0f64),
                FfiValue::from(3usize),
                FfiValue::from(2.0f64),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, FfiError::TypeError { index: 0, .. }), "{:?}", err);
    assert_eq!(native_calls(&lib), before);
}

#[test]
fn test_close_releases_library() {
    let Some((_guard, lib)) = fixture() else {
        return;
    };
    assert!(lib.is_bound("sum_array"));
    lib.close().unwrap();
}


#[test]
fn test_global_registry_lifecycle() {
    if FIXTURE.is_empty() {
        return;
    }
    let _guard = SERIAL.lock();
    let global = nativecall::ffi::registry::global();

    let lib = {
        let mut registry = global.write();
        let lib = registry.load_library("fixture", Some(FIXTURE)).unwrap();
        let sig = FfiSignature::parse("i32 id_i32(i32)").unwrap();
        unsafe { registry.bind("fixture", sig) }.unwrap();

        // Loading the same name again hands back the registered handle
        let again = registry.load_library("fixture", Some(FIXTURE)).unwrap();
        assert!(Arc::ptr_eq(&lib, &again));
        lib
    };

    // Calls share the registry; holding one reader does not block another
    let first = global.read();
    let second = global.read();
    assert_eq!(
        first
            .call("fixture:id_i32", &mut [FfiValue::from(-123i32)])
            .unwrap(),
        FfiValue::Int(-123)
    );
    assert_eq!(
        second
            .call("fixture:id_i32", &mut [FfiValue::from(7i32)])
            .unwrap(),
        FfiValue::Int(7)
    );
    assert_eq!(first.list_libraries(), vec!["fixture"]);
    drop((first, second));

    // A cloned handle calls without touching the lock
    assert_eq!(
        lib.call("id_i32", &mut [FfiValue::from(5i32)]).unwrap(),
        FfiValue::Int(5)
    );
    assert_eq!(lib.call_count("id_i32"), Some(3));
    drop(lib);

    let mut registry = global.write();
    registry.shutdown();
    assert!(registry.get("fixture").is_none());
    assert!(matches!(
        registry.call("fixture:id_i32", &mut [FfiValue::from(1i32)]),
        Err(FfiError::LibraryNotFound(_))
    ));
}
