/// Builds [`Conditions`](crate::query::Conditions) from key/value pairs.
///
/// Identifier keys (`name = value`) are property names. String-literal keys
/// (`"u.age" => value`) allow qualified `alias.column` references. Values
/// go through `serde_json::json!`.
///
/// # Example
///
/// ```ignore
/// let users = repo.find(conditions! { name = "Ada", "u.age" => 36 }.into()).await?;
/// ```
#[macro_export]
macro_rules! conditions {
    (@insert $map:ident;) => {};
    (@insert $map:ident; $key:ident = $value:expr $(, $($rest:tt)*)?) => {
        $map.insert(stringify!($key).to_string(), $crate::__serde_json::json!($value));
        $crate::conditions!(@insert $map; $($($rest)*)?);
    };
    (@insert $map:ident; $key:literal => $value:expr $(, $($rest:tt)*)?) => {
        $map.insert($key.to_string(), $crate::__serde_json::json!($value));
        $crate::conditions!(@insert $map; $($($rest)*)?);
    };
    ($($body:tt)*) => {{
        #[allow(unused_mut)]
        let mut conditions = $crate::query::Conditions::new();
        $crate::conditions!(@insert conditions; $($body)*);
        conditions
    }};
}
