/*!
Derive macro for csvbind's compile-time record binding.

`#[derive(CsvRecord)]` turns a plain struct with named fields into a
schema-bound record type: the schema is built once, and the generated
parse and emit routines walk the fields in ordinal order with no runtime
reflection.

Schema violations are reported as build-time diagnostics with stable
identifiers (`S-01` through `S-10`); errors fail the build, warnings are
surfaced through the deprecation lint.
*/

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{
    parse_macro_input, Data, DeriveInput, Error, Fields, GenericArgument,
    Ident, LitBool, LitInt, LitStr, Path, PathArguments, Result, Type,
};

/// Derives the `CsvRecord` trait for a struct with named fields.
///
/// # Struct attributes
///
/// `#[csv(delimiter = ";", has_headers = false, strict = false,
/// trim = true)]`
///
/// # Field attributes
///
/// `#[csv(ordinal = 0)]` is required on every field. Optional:
/// `name = "Header"`, `format = "%Y-%m-%d"`, `converter = MyCodec`,
/// `required`, `default = "0"`.
#[proc_macro_derive(CsvRecord, attributes(csv))]
pub fn derive_csv_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct RecordAttrs {
    delimiter: Option<u8>,
    has_headers: Option<bool>,
    strict: Option<bool>,
    trim: Option<bool>,
}

struct FieldModel {
    member: Ident,
    csv_name: String,
    ordinal: u32,
    kind: Ident,
    inner_ty: Type,
    nullable: bool,
    required: bool,
    format: Option<String>,
    default: Option<String>,
    converter: Option<Path>,
}

fn expand(input: &DeriveInput) -> Result<TokenStream2> {
    if !input.generics.params.is_empty() {
        return Err(diag_error(
            input.generics.span(),
            "S-01",
            "a record type with generic parameters cannot carry a static \
             schema binding",
        ));
    }
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(diag_error(
                    input.ident.span(),
                    "S-10",
                    "record types must be structs with named fields",
                ))
            }
        },
        _ => {
            return Err(diag_error(
                input.ident.span(),
                "S-10",
                "record types must be structs, not enums or unions",
            ))
        }
    };

    let record_attrs = parse_record_attrs(input)?;
    let mut models = Vec::with_capacity(fields.len());
    for field in fields {
        models.push(parse_field(field)?);
    }
    models.sort_by_key(|model| model.ordinal);

    let mut warnings = TokenStream2::new();
    if models.is_empty() {
        warnings.extend(diag_warning(
            &input.ident,
            "S-05",
            &format!("record '{}' has no fields", input.ident),
        ));
    }
    for i in 1..models.len() {
        if models[i].ordinal == models[i - 1].ordinal {
            return Err(diag_error(
                models[i].member.span(),
                "S-02",
                &format!(
                    "ordinal {} is used by both '{}' and '{}'",
                    models[i].ordinal,
                    models[i - 1].member,
                    models[i].member,
                ),
            ));
        }
    }
    for (i, model) in models.iter().enumerate() {
        if models[..i].iter().any(|m| m.csv_name == model.csv_name) {
            warnings.extend(diag_warning(
                &model.member,
                "S-09",
                &format!("csv name '{}' is used more than once", model.csv_name),
            ));
        }
    }

    let name = &input.ident;
    let name_str = name.to_string();
    let schema_fields = models.iter().map(field_spec_tokens);
    let options = record_options_tokens(&record_attrs);

    let parse_lets = models.iter().enumerate().map(|(i, model)| {
        let var = format_ident!("__field_{}", model.member);
        let expr = parse_expr(i, model);
        quote! { let #var = #expr; }
    });
    let init_members = models.iter().map(|model| {
        let member = &model.member;
        let var = format_ident!("__field_{}", model.member);
        quote! { #member: #var }
    });
    let emit_stmts =
        models.iter().enumerate().map(|(i, model)| emit_stmt(i, model));

    Ok(quote! {
        #warnings

        #[automatically_derived]
        impl ::csvbind::CsvRecord for #name {
            fn schema() -> &'static ::csvbind::Schema {
                static SCHEMA: ::std::sync::OnceLock<::csvbind::Schema> =
                    ::std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    let mut builder = ::csvbind::Schema::builder(#name_str);
                    builder.options(#options);
                    #(builder.field(#schema_fields);)*
                    builder
                        .build()
                        .expect("schema was validated when the binding was derived")
                })
            }

            fn parse_record(
                stream: &mut ::csvbind::FieldStream<'_>,
            ) -> ::csvbind::Result<Self> {
                #(#parse_lets)*
                ::std::result::Result::Ok(#name { #(#init_members,)* })
            }

            fn emit_record(
                &self,
                sink: &mut ::csvbind::FieldSink<'_>,
            ) -> ::csvbind::Result<()> {
                #(#emit_stmts)*
                ::std::result::Result::Ok(())
            }
        }
    })
}

fn parse_record_attrs(input: &DeriveInput) -> Result<RecordAttrs> {
    let mut attrs = RecordAttrs {
        delimiter: None,
        has_headers: None,
        strict: None,
        trim: None,
    };
    for attr in &input.attrs {
        if !attr.path().is_ident("csv") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("delimiter") {
                let lit: LitStr = meta.value()?.parse()?;
                let value = lit.value();
                let bytes = value.as_bytes();
                if bytes.len() != 1 {
                    return Err(Error::new(
                        lit.span(),
                        "delimiter must be a single byte",
                    ));
                }
                attrs.delimiter = Some(bytes[0]);
            } else if meta.path.is_ident("has_headers") {
                let lit: LitBool = meta.value()?.parse()?;
                attrs.has_headers = Some(lit.value());
            } else if meta.path.is_ident("strict") {
                let lit: LitBool = meta.value()?.parse()?;
                attrs.strict = Some(lit.value());
            } else if meta.path.is_ident("trim") {
                let lit: LitBool = meta.value()?.parse()?;
                attrs.trim = Some(lit.value());
            } else {
                return Err(meta.error("unrecognized record option"));
            }
            Ok(())
        })?;
    }
    Ok(attrs)
}

fn parse_field(field: &syn::Field) -> Result<FieldModel> {
    let member = field
        .ident
        .clone()
        .expect("named fields were checked by the caller");
    let mut ordinal: Option<u32> = None;
    let mut csv_name: Option<String> = None;
    let mut format = None;
    let mut default = None;
    let mut required = false;
    let mut converter: Option<Path> = None;

    for attr in &field.attrs {
        if !attr.path().is_ident("csv") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("ordinal") {
                let lit: LitInt = meta.value()?.parse()?;
                let value: i64 = lit.base10_parse()?;
                if value < 0 {
                    return Err(diag_error(
                        lit.span(),
                        "S-06",
                        &format!(
                            "field '{}' has a negative ordinal",
                            member,
                        ),
                    ));
                }
                ordinal = Some(u32::try_from(value).map_err(|_| {
                    Error::new(lit.span(), "ordinal is out of range")
                })?);
            } else if meta.path.is_ident("name") {
                let lit: LitStr = meta.value()?.parse()?;
                let value = lit.value();
                if value.is_empty() {
                    return Err(diag_error(
                        lit.span(),
                        "S-08",
                        &format!("field '{}' has an empty csv name", member),
                    ));
                }
                csv_name = Some(value);
            } else if meta.path.is_ident("format") {
                let lit: LitStr = meta.value()?.parse()?;
                format = Some(lit.value());
            } else if meta.path.is_ident("default") {
                let lit: LitStr = meta.value()?.parse()?;
                default = Some(lit.value());
            } else if meta.path.is_ident("required") {
                required = true;
            } else if meta.path.is_ident("converter") {
                let path: Path = meta.value()?.parse().map_err(|_| {
                    diag_error(
                        meta.path.span(),
                        "S-07",
                        &format!(
                            "converter for field '{}' must be a type path",
                            member,
                        ),
                    )
                })?;
                converter = Some(path);
            } else {
                return Err(meta.error("unrecognized field option"));
            }
            Ok(())
        })?;
    }

    let Some(ordinal) = ordinal else {
        return Err(Error::new(
            member.span(),
            format!("field '{}' needs a `#[csv(ordinal = N)]` attribute", member),
        ));
    };

    let (nullable, inner_ty) = unwrap_option(&field.ty);
    let kind = classify(&inner_ty, converter.is_some(), &member)?;

    Ok(FieldModel {
        csv_name: csv_name.unwrap_or_else(|| member.to_string()),
        member,
        ordinal,
        kind,
        inner_ty,
        nullable,
        required,
        format,
        default,
        converter,
    })
}

/// Splits `Option<T>` into (true, T); any other type is (false, itself).
fn unwrap_option(ty: &Type) -> (bool, Type) {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if segment.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments
                {
                    if args.args.len() == 1 {
                        if let GenericArgument::Type(inner) = &args.args[0] {
                            return (true, inner.clone());
                        }
                    }
                }
            }
        }
    }
    (false, ty.clone())
}

/// Maps a field type to its `ValueKind` variant name.
fn classify(ty: &Type, has_converter: bool, member: &Ident) -> Result<Ident> {
    if has_converter {
        return Ok(Ident::new("Custom", Span::call_site()));
    }
    let segment = match ty {
        Type::Path(path) => match path.path.segments.last() {
            Some(segment) => segment,
            None => {
                return Err(diag_error(
                    ty.span(),
                    "S-03",
                    &format!("field '{}' has an unsupported type", member),
                ))
            }
        },
        Type::Tuple(_) | Type::Array(_) | Type::Slice(_)
        | Type::Reference(_) => {
            return Err(diag_error(
                ty.span(),
                "S-04",
                &format!(
                    "field '{}' has a composite type; flatten it or attach \
                     a converter",
                    member,
                ),
            ))
        }
        _ => {
            return Err(diag_error(
                ty.span(),
                "S-03",
                &format!("field '{}' has an unsupported type", member),
            ))
        }
    };
    let kind = match segment.ident.to_string().as_str() {
        "bool" => "Bool",
        "i8" => "I8",
        "i16" => "I16",
        "i32" => "I32",
        "i64" => "I64",
        "u8" => "U8",
        "u16" => "U16",
        "u32" => "U32",
        "u64" => "U64",
        "f32" => "F32",
        "f64" => "F64",
        "Decimal" => "Decimal",
        "char" => "Char",
        "String" => "String",
        "NaiveDateTime" => "Instant",
        "DateTime" => "InstantWithOffset",
        "Uuid" => "Uuid",
        "TimeDelta" | "Duration" => "Duration",
        other => {
            return Err(diag_error(
                segment.ident.span(),
                "S-03",
                &format!(
                    "field '{}' has unsupported type '{}' and no converter",
                    member, other,
                ),
            ))
        }
    };
    Ok(Ident::new(kind, Span::call_site()))
}

fn record_options_tokens(attrs: &RecordAttrs) -> TokenStream2 {
    let mut tokens = quote! { ::csvbind::RecordOptions::new() };
    if let Some(delimiter) = attrs.delimiter {
        tokens.extend(quote! { .delimiter(#delimiter) });
    }
    if let Some(has_headers) = attrs.has_headers {
        tokens.extend(quote! { .has_headers(#has_headers) });
    }
    if let Some(strict) = attrs.strict {
        tokens.extend(quote! { .strict(#strict) });
    }
    if let Some(trim) = attrs.trim {
        tokens.extend(quote! { .trim(#trim) });
    }
    tokens
}

fn field_spec_tokens(model: &FieldModel) -> TokenStream2 {
    let member = model.member.to_string();
    let csv_name = &model.csv_name;
    let ordinal = model.ordinal;
    let kind = &model.kind;
    let nullable = model.nullable;
    let required = model.required;
    let mut tokens = quote! {
        ::csvbind::FieldSpec::new(
            #member,
            #ordinal,
            ::csvbind::ValueKind::#kind,
        )
        .csv_name(#csv_name)
        .nullable(#nullable)
        .required(#required)
    };
    if let Some(ref format) = model.format {
        tokens.extend(quote! { .format(#format) });
    }
    if let Some(ref default) = model.default {
        tokens.extend(quote! { .default_value(#default) });
    }
    if model.converter.is_some() {
        tokens.extend(quote! { .converter() });
    }
    tokens
}

fn parse_expr(index: usize, model: &FieldModel) -> TokenStream2 {
    let inner = &model.inner_ty;
    match (&model.converter, model.nullable) {
        (Some(converter), true) => quote! {
            stream.convert_opt(
                #index,
                <#converter as ::csvbind::Converter<#inner>>::decode,
            )?
        },
        (Some(converter), false) => quote! {
            stream.convert(
                #index,
                <#converter as ::csvbind::Converter<#inner>>::decode,
            )?
        },
        (None, true) => quote! { stream.decode_opt::<#inner>(#index)? },
        (None, false) => quote! { stream.decode::<#inner>(#index)? },
    }
}

fn emit_stmt(index: usize, model: &FieldModel) -> TokenStream2 {
    let member = &model.member;
    let inner = &model.inner_ty;
    match (&model.converter, model.nullable) {
        (Some(converter), true) => quote! {
            sink.write_converted_opt(
                #index,
                self.#member.as_ref(),
                <#converter as ::csvbind::Converter<#inner>>::encode,
            )?;
        },
        (Some(converter), false) => quote! {
            sink.write_converted(
                #index,
                &self.#member,
                <#converter as ::csvbind::Converter<#inner>>::encode,
            )?;
        },
        (None, true) => quote! {
            sink.write_opt(#index, self.#member.as_ref())?;
        },
        (None, false) => quote! {
            sink.write(#index, &self.#member)?;
        },
    }
}

fn diag_error(span: Span, id: &str, message: &str) -> Error {
    Error::new(span, format!("{}: {}", id, message))
}

/// Surfaces a non-fatal schema diagnostic through the deprecation lint;
/// the build keeps going.
fn diag_warning(near: &Ident, id: &str, message: &str) -> TokenStream2 {
    let note = format!("{}: {}", id, message);
    let marker = format_ident!("__CsvSchemaWarning{}", near);
    quote! {
        const _: () = {
            #[deprecated(note = #note)]
            struct #marker;
            #[allow(dead_code)]
            fn __csv_schema_warning() {
                let _ = #marker;
            }
        };
    }
}
