// End-to-end lowering tests.
//
// Each demo pipeline is lowered for the host, interpreted on its bound
// inputs, and compared against a reference computed directly in Rust from
// the same input buffers. The rest covers the module shape: argument
// inference errors, the legacy wrapper, observers and GPU API selection.

use lnc::demos::Demo;
use lnc::interp::{Buffer, Interpreter};
use lnc::ir::{DeviceApi, Type};
use lnc::lower::{ArgumentKind, Linkage, RecordingObserver};
use lnc::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn demo(name: &str) -> Demo {
    Demo::by_name(name).unwrap().unwrap()
}

/// Lower and interpret `d`; returns the interpreter holding every buffer.
fn run_demo(d: &Demo, options: &LowerOptions) -> Interpreter {
    let module = lower(&d.pipeline, &d.outputs, &d.args, options, Vec::new())
        .unwrap_or_else(|e| panic!("{}: lowering failed: {}", d.name, e));
    let mut it = Interpreter::new();
    d.bind(&mut it);
    it.run(&module).unwrap_or_else(|e| {
        panic!(
            "{}: interpretation failed: {}\n{}",
            d.name, e, module.functions[0].body
        )
    });
    it
}

fn at(b: &Buffer, c: &[i64]) -> i64 {
    b.get(c).unwrap_or_else(|| panic!("no element at {:?}", c)) as i64
}

// ── Demo pipelines against references ───────────────────────────────────────

#[test]
fn blur_matches_reference() {
    let d = demo("blur");
    let it = run_demo(&d, &LowerOptions::default());
    let input = it.buffer("input").unwrap();
    let out = it.buffer("blur_y").unwrap();

    let bx = |x: i64, y: i64| (at(input, &[x, y]) + at(input, &[x + 1, y]) + at(input, &[x + 2, y])) / 3;
    for y in 0..8 {
        for x in 0..16 {
            let expected = (bx(x, y) + bx(x, y + 1) + bx(x, y + 2)) / 3;
            assert_eq!(at(out, &[x, y]), expected, "blur_y({}, {})", x, y);
        }
    }
}

#[test]
fn histogram_matches_reference() {
    let d = demo("histogram");
    let it = run_demo(&d, &LowerOptions::default());
    let input = it.buffer("input").unwrap();
    let mut expected = [0i64; 16];
    for y in 0..8 {
        for x in 0..12 {
            expected[at(input, &[x, y]).clamp(0, 15) as usize] += 1;
        }
    }
    let out = it.buffer("hist").unwrap();
    let got: Vec<i64> = (0..16).map(|b| at(out, &[b])).collect();
    assert_eq!(got, expected.to_vec());
    assert_eq!(got.iter().sum::<i64>(), 96);
}

#[test]
fn matmul_matches_reference() {
    let d = demo("matmul");
    let it = run_demo(&d, &LowerOptions::default());
    let (a, b) = (it.buffer("A").unwrap(), it.buffer("B").unwrap());
    let out = it.buffer("C").unwrap();
    for y in 0..8 {
        for x in 0..16 {
            let expected: i64 = (0..16).map(|k| at(a, &[k, y]) * at(b, &[x, k])).sum();
            assert_eq!(at(out, &[x, y]), expected, "C({}, {})", x, y);
        }
    }
}

// ── Arguments ───────────────────────────────────────────────────────────────

#[test]
fn arguments_are_declared_then_outputs() {
    let d = demo("matmul");
    let m = lower(&d.pipeline, &d.outputs, &d.args, &LowerOptions::default(), Vec::new()).unwrap();
    let args: Vec<(&str, ArgumentKind, usize)> = m
        .entry()
        .unwrap()
        .args
        .iter()
        .map(|a| (a.name.as_str(), a.kind, a.dimensions))
        .collect();
    assert_eq!(
        args,
        vec![
            ("A", ArgumentKind::InputBuffer, 2),
            ("B", ArgumentKind::InputBuffer, 2),
            ("C", ArgumentKind::OutputBuffer, 2),
        ]
    );
}

#[test]
fn undeclared_input_is_reported() {
    let d = demo("blur");
    let err = lower(&d.pipeline, &d.outputs, &[], &LowerOptions::default(), Vec::new()).unwrap_err();
    assert_eq!(err.code(), Some("E0501"));
    assert!(err.to_string().contains("input"), "{}", err);
}

#[test]
fn scalar_parameter_must_be_declared_as_scalar() {
    let mut p = Pipeline::new();
    let k = p.param("k", Type::i32()).unwrap();
    let x = Var::new("x");
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![x.expr() * k.expr()]).unwrap();

    let wrong = vec![Argument::input_buffer("k", Type::i32(), 1)];
    let err = lower(&p, &[f], &wrong, &LowerOptions::default(), Vec::new()).unwrap_err();
    assert_eq!(err.code(), Some("E0502"));

    let args = vec![Argument::from(&k)];
    let m = lower(&p, &[f], &args, &LowerOptions::default(), Vec::new()).unwrap();
    let mut it = Interpreter::new();
    it.set_scalar("k", lnc::interp::Value::int(3));
    it.set_buffer("f", Buffer::new(Type::i32(), &[4]));
    it.run(&m).unwrap();
    assert_eq!(it.buffer("f").unwrap().data, vec![0.0, 3.0, 6.0, 9.0]);
}

#[test]
fn missing_input_fails_at_run_time() {
    let d = demo("matmul");
    let m = lower(&d.pipeline, &d.outputs, &d.args, &LowerOptions::default(), Vec::new()).unwrap();
    let mut it = Interpreter::new();
    it.set_buffer("C", Buffer::new(Type::i32(), &[16, 8]));
    let err = it.run(&m).unwrap_err();
    assert_eq!(err.code(), Some("E0603"));
}

// ── Module shape ────────────────────────────────────────────────────────────

#[test]
fn module_is_named_after_the_pipeline() {
    let d = demo("blur");
    let options = LowerOptions {
        pipeline_name: "box3".to_string(),
        ..Default::default()
    };
    let m = lower(&d.pipeline, &d.outputs, &d.args, &options, Vec::new()).unwrap();
    assert_eq!(m.entry().unwrap().name, "box3");
    let legacy = m.function("box3_legacy").unwrap();
    assert_eq!(legacy.linkage, Linkage::ExternalLegacy);

    let options = LowerOptions {
        legacy_wrapper: false,
        ..options
    };
    let m = lower(&d.pipeline, &d.outputs, &d.args, &options, Vec::new()).unwrap();
    assert_eq!(m.functions.len(), 1);
}

#[test]
fn observer_sees_every_pass_once() {
    let d = demo("histogram");
    let mut obs = RecordingObserver::default();
    lower_with_observer(
        &d.pipeline,
        &d.outputs,
        &d.args,
        &LowerOptions::default(),
        Vec::new(),
        &mut obs,
    )
    .unwrap();
    let ran: Vec<&str> = obs.passes.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(ran.first(), Some(&"wrap_calls"));
    assert_eq!(ran.iter().filter(|n| **n == "vectorize").count(), 1);
    assert_eq!(ran.iter().filter(|n| **n == "simplify").count(), 2);
    for once in ["add_parameter_checks", "add_image_checks", "trim_no_ops"] {
        assert_eq!(ran.iter().filter(|n| **n == once).count(), 1, "{}", once);
    }
    assert!(!ran.contains(&"offload"));
    assert!(obs.skipped.iter().any(|s| s == "offload"));
}

#[test]
fn gpu_loops_get_the_target_api() {
    let mut p = Pipeline::new();
    let x = Var::new("x");
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![x.expr() + 1]).unwrap();
    p.stage(f, 0)
        .unwrap()
        .split(&x, "xo", "xi", 16, TailStrategy::GuardWithIf)
        .unwrap()
        .gpu(&["xo"], &["xi"], DeviceApi::DefaultGpu)
        .unwrap();

    let cuda = LowerOptions::for_target("host-cuda".parse().unwrap());
    let m = lower(&p, &[f], &[], &cuda, Vec::new()).unwrap();
    let body = m.entry().unwrap().body.to_string();
    assert!(body.contains("__block_id_x"), "{}", body);
    assert!(body.contains("__thread_id_x"), "{}", body);
    assert!(body.contains("<Cuda>"), "{}", body);
    assert!(!body.contains("DefaultGpu"), "{}", body);
}

#[test]
fn offload_target_extracts_device_kernels() {
    let mut p = Pipeline::new();
    let x = Var::new("x");
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![x.expr() * 5]).unwrap();
    p.stage(f, 0)
        .unwrap()
        .split(&x, "xo", "xi", 4, TailStrategy::GuardWithIf)
        .unwrap()
        .offload_to("xo", DeviceApi::Hexagon)
        .unwrap();

    let hvx = LowerOptions::for_target("hexagon-32-noos-hvx".parse().unwrap());
    let m = lower(&p, &[f], &[], &hvx, Vec::new()).unwrap();
    assert_eq!(m.kernels.len(), 1);
    assert_eq!(m.kernels[0].device, "hexagon");
    let body = m.entry().unwrap().body.to_string();
    assert!(body.contains("halide_device_run"), "{}", body);

    let mut it = Interpreter::new();
    it.set_buffer("f", Buffer::new(Type::i32(), &[10]));
    it.run(&m).unwrap();
    let expected: Vec<f64> = (0..10).map(|v| (v * 5) as f64).collect();
    assert_eq!(it.buffer("f").unwrap().data, expected);

    // An FPGA target offloads, but has no Hexagon device.
    let fpga = LowerOptions::for_target("x86-64-linux-intel_fpga".parse().unwrap());
    let err = lower(&p, &[f], &[], &fpga, Vec::new()).unwrap_err();
    assert_eq!(err.code(), Some("E0309"));
}
