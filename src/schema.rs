// Table layout of the durable observation journal.

diesel::table! {
    edge_observations (id) {
        id -> Integer,
        src -> Text,
        tgt -> Text,
        prob -> Double,
        evidence -> Text,
        ts -> Text,
    }
}
