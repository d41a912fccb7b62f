mod message;

use proc_macro::TokenStream;

/// Derive macro for bus messages.
///
/// Implements `sourced_bus::Message`, whose `type_name()` drives routing,
/// queue mappings and handler dispatch. The type name defaults to the struct
/// name and can be overridden:
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Message)]
/// #[message(name = "billing.OrderPlaced")]
/// struct OrderPlaced {
///     order_id: String,
/// }
///
/// assert_eq!(OrderPlaced::type_name(), "billing.OrderPlaced");
/// ```
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    message::derive_message(input)
}
