//! Derive macros for the SSFX particle pipeline.
//!
//! This crate provides one derive macro:
//!
//! - [`GpuStruct`] - Emits the WGSL struct definition of a `#[repr(C)]` record
//!
//! # Usage
//!
//! The macro is re-exported from the main `ssfx` crate. You don't need
//! to add this crate directly:
//!
//! ```ignore
//! use ssfx::GpuStruct;
//!
//! #[repr(C)]
//! #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, GpuStruct)]
//! struct Spark {
//!     position: [f32; 3],
//!     age: f32,
//! }
//!
//! assert!(Spark::WGSL_STRUCT.contains("position: vec3<f32>,"));
//! ```
//!
//! # GPU Memory Layout
//!
//! Unlike a derive that *inserts* padding, `GpuStruct` only *checks* it: the
//! Rust record is the source of truth and is uploaded byte for byte, so every
//! field must already sit at the offset WGSL would give it.
//!
//! - `[f32; 3]` maps to `vec3<f32>`, which is 16-byte aligned
//! - `[[f32; 4]; N]` maps to `array<vec4<f32>, N>` (stride 16)
//! - `[[f32; 3]; N]` is rejected (WGSL stride 16, Rust stride 12)
//! - The struct size must be a multiple of its largest alignment

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Expr, Fields, Lit, Type};

/// Derive macro for GPU-mirrored records.
///
/// Generates an implementation of `ssfx::GpuStruct` carrying the WGSL
/// struct definition, so host and kernels share one layout.
///
/// # Supported Types
///
/// | Rust Type | WGSL Type | Size | Alignment |
/// |-----------|-----------|------|-----------|
/// | `f32` / `u32` / `i32` | `f32` / `u32` / `i32` | 4 | 4 |
/// | `[f32; 2]` | `vec2<f32>` | 8 | 8 |
/// | `[f32; 3]` | `vec3<f32>` | 12 | 16 |
/// | `[f32; 4]` | `vec4<f32>` | 16 | 16 |
/// | `[u32; 2..=4]` | `vecN<u32>` | 4N | vector rules |
/// | `[T; N]` (other N) | `array<T, N>` | N * stride | element alignment |
///
/// # Panics
///
/// The macro panics at compile time if:
/// - Applied to an enum or a tuple struct
/// - A field has an unsupported type or a non-literal array length
/// - A field would land at a different offset in WGSL than in Rust
/// - The Rust size differs from the WGSL size (missing trailing padding)
#[proc_macro_derive(GpuStruct)]
pub fn derive_gpu_struct(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let name_str = name.to_string();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => panic!("GpuStruct derive only supports structs with named fields"),
        },
        _ => panic!("GpuStruct derive only supports structs"),
    };

    let mut wgsl_fields = Vec::new();
    let mut rust_offset = 0u32;
    let mut struct_align = 4u32;

    for field in fields.iter() {
        let field_name = field
            .ident
            .as_ref()
            .expect("named fields always carry an identifier")
            .to_string();
        let info = wgsl_type_info(&field.ty);

        let wgsl_offset = round_up(rust_offset, info.align);
        if wgsl_offset != rust_offset {
            panic!(
                "GpuStruct `{}`: field `{}` is at Rust offset {} but WGSL aligns it to {}; \
                 insert {} bytes of padding before it",
                name_str,
                field_name,
                rust_offset,
                wgsl_offset,
                wgsl_offset - rust_offset
            );
        }

        wgsl_fields.push(format!("    {}: {},", field_name, info.wgsl_type));
        struct_align = struct_align.max(info.align);
        rust_offset += info.size;
    }

    let wgsl_size = round_up(rust_offset, struct_align);
    if wgsl_size != rust_offset {
        panic!(
            "GpuStruct `{}`: Rust size is {} bytes but WGSL rounds it to {}; \
             add {} bytes of trailing padding",
            name_str,
            rust_offset,
            wgsl_size,
            wgsl_size - rust_offset
        );
    }

    let wgsl_struct = format!("struct {} {{\n{}\n}}", name_str, wgsl_fields.join("\n"));

    let expanded = quote! {
        impl ssfx::GpuStruct for #name {
            const WGSL_NAME: &'static str = #name_str;
            const WGSL_STRUCT: &'static str = #wgsl_struct;
            const GPU_SIZE: u32 = #wgsl_size;
        }
    };

    TokenStream::from(expanded)
}

struct TypeInfo {
    wgsl_type: String,
    size: u32,
    align: u32,
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Map a Rust field type to its WGSL counterpart.
fn wgsl_type_info(ty: &Type) -> TypeInfo {
    match ty {
        Type::Path(_) => scalar_info(ty),
        Type::Array(array) => {
            let len = array_len(&array.len);
            match &*array.elem {
                Type::Path(_) => {
                    let scalar = scalar_info(&array.elem);
                    if (2..=4).contains(&len) {
                        // vec3 is padded to 16 bytes of alignment, vec2 to 8
                        let align = if len == 2 { 8 } else { 16 };
                        TypeInfo {
                            wgsl_type: format!("vec{}<{}>", len, scalar.wgsl_type),
                            size: 4 * len,
                            align,
                        }
                    } else {
                        TypeInfo {
                            wgsl_type: format!("array<{}, {}>", scalar.wgsl_type, len),
                            size: 4 * len,
                            align: 4,
                        }
                    }
                }
                Type::Array(_) => {
                    let elem = wgsl_type_info(&array.elem);
                    let stride = round_up(elem.size, elem.align);
                    if stride != elem.size {
                        panic!(
                            "GpuStruct: array of `{}` has WGSL stride {} but Rust stride {}",
                            elem.wgsl_type, stride, elem.size
                        );
                    }
                    TypeInfo {
                        wgsl_type: format!("array<{}, {}>", elem.wgsl_type, len),
                        size: stride * len,
                        align: elem.align,
                    }
                }
                other => panic!("Unsupported array element in GpuStruct: {}", quote!(#other)),
            }
        }
        other => panic!("Unsupported type in GpuStruct: {}", quote!(#other)),
    }
}

fn scalar_info(ty: &Type) -> TypeInfo {
    let type_str = quote!(#ty).to_string().replace(' ', "");
    let wgsl_type = match type_str.as_str() {
        "f32" => "f32",
        "u32" => "u32",
        "i32" => "i32",
        _ => panic!("Unsupported scalar in GpuStruct: {}", type_str),
    };
    TypeInfo {
        wgsl_type: wgsl_type.to_string(),
        size: 4,
        align: 4,
    }
}

fn array_len(expr: &Expr) -> u32 {
    match expr {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Int(int) => int
                .base10_parse::<u32>()
                .unwrap_or_else(|e| panic!("GpuStruct: bad array length: {}", e)),
            _ => panic!("GpuStruct: array length must be an integer literal"),
        },
        _ => panic!("GpuStruct: array length must be an integer literal, not a constant"),
    }
}
