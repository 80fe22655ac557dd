use diesel::prelude::*;

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::edge_observations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EdgeObservation {
    pub id: i32,
    pub src: String,
    pub tgt: String,
    /// Score of this single observation, not the fused probability.
    pub prob: f64,
    /// One-element JSON array holding the evidence record.
    pub evidence: String,
    pub ts: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::edge_observations)]
pub struct NewEdgeObservation<'a> {
    pub src: &'a str,
    pub tgt: &'a str,
    pub prob: f64,
    pub evidence: &'a str,
    pub ts: &'a str,
}
