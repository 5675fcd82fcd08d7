use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=src/backend/cuda_kernel.cu");

    if env::var("CARGO_FEATURE_BACKEND_CUDA").is_err() {
        return;
    }

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR set by cargo");
    let src = Path::new("src/backend/cuda_kernel.cu");
    let dst = Path::new(&out_dir).join("cuda_kernel.ptx");

    let status = Command::new("nvcc")
        .arg("--ptx")
        .arg(src)
        .arg("-o")
        .arg(&dst)
        .status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => panic!("nvcc exited with status {s}"),
        Err(e) => panic!(
            "failed to invoke nvcc to compile {}: {e} (CUDA toolkit required for backend-cuda)",
            src.display()
        ),
    }
}
